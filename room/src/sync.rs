//! Avatar and canvas state, and the rules for merging remote updates into it.

use log::{debug, trace, warn};
use room_core::{
    AvatarState, CanvasId, CanvasState, CanvasUpdate, Error, PeerId, PlayerInfo, PlayerMove,
    RequestAllCanvasData, Vec3, BROADCAST_INTERVAL, FULL_SYNC_RETRY,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

/// Result of applying a remote avatar message
#[derive(Debug, Clone, PartialEq)]
pub enum AvatarApply {
    /// First time this peer's avatar was seen
    Joined(AvatarState),
    /// An existing avatar changed
    Updated(AvatarState),
    /// The message described ourselves
    Ignored,
}

/// Result of applying a canvas update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanvasApply {
    /// The update was strictly newer and replaced the local copy
    Applied(CanvasState),
    /// Not newer than what we have
    Stale,
    /// No such canvas slot
    Unknown,
}

/// What to do when a full sync check fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullSyncStep {
    /// The peer answered, or we are out of retries
    Done,
    /// Send the request again, then check after `next_check` if there is one
    Resend { next_check: Option<Duration> },
}

#[derive(Debug, Default)]
struct FullSync {
    resent: usize,
    answered: bool,
}

/// Canonical local copy of every avatar and canvas
#[derive(Debug)]
pub struct StateSyncEngine {
    local: AvatarState,
    avatars: HashMap<PeerId, AvatarState>,
    canvases: BTreeMap<CanvasId, CanvasState>,
    pose_dirty: bool,
    last_broadcast: Option<Instant>,
    editing: HashSet<CanvasId>,
    full_sync: HashMap<PeerId, FullSync>,
}

impl StateSyncEngine {
    pub fn new(local: AvatarState, slots: &[CanvasId]) -> Self {
        let canvases = slots
            .iter()
            .map(|id| (id.clone(), CanvasState::blank(id.clone())))
            .collect();
        Self {
            local,
            avatars: HashMap::new(),
            canvases,
            // Announce the initial pose once
            pose_dirty: true,
            last_broadcast: None,
            editing: HashSet::new(),
            full_sync: HashMap::new(),
        }
    }

    pub fn local(&self) -> &AvatarState {
        &self.local
    }

    pub fn local_id(&self) -> &PeerId {
        &self.local.peer_id
    }

    /// Our own description, as sent when a connection opens
    pub fn player_info(&self) -> PlayerInfo {
        PlayerInfo::from(&self.local)
    }

    /// Take a new local identity, keeping pose, name and color
    pub fn set_local_id(&mut self, peer_id: PeerId) {
        self.local.peer_id = peer_id;
        self.pose_dirty = true;
    }

    /// Record local input. Nothing is sent until the next broadcast slot.
    /// Non-finite coordinates cannot travel as JSON and are ignored.
    pub fn set_pose(&mut self, position: Vec3, heading: f32) {
        if ![position.x, position.y, position.z, heading]
            .iter()
            .all(|v| v.is_finite())
        {
            warn!("Ignoring non-finite pose {:?} / {}", position, heading);
            return;
        }
        if self.local.position != position || self.local.heading != heading {
            self.local.position = position;
            self.local.heading = heading;
            self.pose_dirty = true;
        }
    }

    /// The pose to broadcast now, if it changed and the 10 Hz cap allows it
    pub fn poll_broadcast(&mut self, now: Instant) -> Option<PlayerMove> {
        if !self.pose_dirty {
            return None;
        }
        if let Some(last) = self.last_broadcast {
            if now.saturating_duration_since(last) < BROADCAST_INTERVAL {
                return None;
            }
        }

        self.pose_dirty = false;
        self.last_broadcast = Some(now);
        Some(PlayerMove {
            position: self.local.position,
            rotation: self.local.heading,
        })
    }

    pub fn avatar(&self, peer_id: &PeerId) -> Option<&AvatarState> {
        self.avatars.get(peer_id)
    }

    /// Remote avatars sorted by peer id
    pub fn avatars(&self) -> Vec<AvatarState> {
        let mut avatars: Vec<AvatarState> = self.avatars.values().cloned().collect();
        avatars.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        avatars
    }

    pub fn apply_player_info(&mut self, info: PlayerInfo) -> AvatarApply {
        if &info.id == self.local_id() {
            return AvatarApply::Ignored;
        }

        let avatar = AvatarState::from(info);
        match self.avatars.insert(avatar.peer_id.clone(), avatar.clone()) {
            None => AvatarApply::Joined(avatar),
            Some(_) => AvatarApply::Updated(avatar),
        }
    }

    /// Moves are applied as they arrive; the last one received wins.
    pub fn apply_move(&mut self, from: &PeerId, update: PlayerMove) -> AvatarApply {
        if from == self.local_id() {
            return AvatarApply::Ignored;
        }

        match self.avatars.get_mut(from) {
            Some(avatar) => {
                avatar.position = update.position;
                avatar.heading = update.rotation;
                AvatarApply::Updated(avatar.clone())
            }
            None => {
                debug!("Move from {} before its PlayerInfo, adding placeholder", from);
                let mut avatar = AvatarState::new(from.clone(), from.to_string(), 0);
                avatar.position = update.position;
                avatar.heading = update.rotation;
                self.avatars.insert(from.clone(), avatar.clone());
                AvatarApply::Joined(avatar)
            }
        }
    }

    /// Returns true if the peer had an avatar
    pub fn remove_avatar(&mut self, peer_id: &PeerId) -> bool {
        self.full_sync.remove(peer_id);
        self.avatars.remove(peer_id).is_some()
    }

    /// Drop every remote avatar, returning whose they were
    pub fn clear_remote(&mut self) -> Vec<PeerId> {
        self.full_sync.clear();
        let mut peers: Vec<PeerId> = self.avatars.drain().map(|(peer, _)| peer).collect();
        peers.sort();
        peers
    }

    pub fn canvas(&self, canvas_id: &CanvasId) -> Option<&CanvasState> {
        self.canvases.get(canvas_id)
    }

    /// Every slot, sorted by canvas id
    pub fn canvases(&self) -> Vec<CanvasState> {
        self.canvases.values().cloned().collect()
    }

    pub fn is_editing(&self, canvas_id: &CanvasId) -> bool {
        self.editing.contains(canvas_id)
    }

    /// Open a local edit session and hand out the current content
    pub fn begin_edit(&mut self, canvas_id: &CanvasId) -> Result<CanvasState, Error> {
        let canvas = self
            .canvases
            .get(canvas_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("No canvas named {}", canvas_id)))?;
        self.editing.insert(canvas_id.clone());
        Ok(canvas)
    }

    /// Finish a local edit: stamp it with `now_millis` and run it through the
    /// same last-writer-wins rule as remote updates. The returned update is
    /// what gets broadcast.
    pub fn commit_canvas(
        &mut self,
        canvas_id: &CanvasId,
        image: Vec<u8>,
        now_millis: u64,
    ) -> Result<(CanvasUpdate, CanvasApply), Error> {
        if !self.canvases.contains_key(canvas_id) {
            return Err(Error::NotFound(format!("No canvas named {}", canvas_id)));
        }
        self.editing.remove(canvas_id);

        let update = CanvasUpdate {
            canvas_id: canvas_id.clone(),
            image_data: image,
            updated_at_millis: now_millis,
        };
        let outcome = self.apply_canvas(update.clone());
        if outcome == CanvasApply::Stale {
            warn!(
                "Local edit of {} lost to a newer remote version; check the clock",
                canvas_id
            );
        }
        Ok((update, outcome))
    }

    /// Last-writer-wins: strictly newer timestamps replace, ties keep ours.
    pub fn apply_canvas(&mut self, update: CanvasUpdate) -> CanvasApply {
        let Some(current) = self.canvases.get_mut(&update.canvas_id) else {
            return CanvasApply::Unknown;
        };

        if update.updated_at_millis <= current.updated_at_millis {
            trace!(
                "Stale update for {} ({} <= {})",
                update.canvas_id,
                update.updated_at_millis,
                current.updated_at_millis
            );
            return CanvasApply::Stale;
        }

        *current = CanvasState::from(update);
        CanvasApply::Applied(current.clone())
    }

    /// Content for a full sync reply; blank slots are skipped
    pub fn canvas_snapshot(&self) -> Vec<CanvasUpdate> {
        self.canvases
            .values()
            .filter(|canvas| !canvas.is_blank())
            .map(CanvasUpdate::from)
            .collect()
    }

    /// Start tracking a full sync with `peer`. Returns the request to send
    /// and when to check for an answer.
    pub fn begin_full_sync(&mut self, peer: &PeerId) -> (RequestAllCanvasData, Duration) {
        self.full_sync.insert(peer.clone(), FullSync::default());
        (self.full_sync_request(), FULL_SYNC_RETRY[0])
    }

    pub fn full_sync_request(&self) -> RequestAllCanvasData {
        RequestAllCanvasData {
            requester_id: self.local_id().clone(),
        }
    }

    /// Any canvas content from `peer` counts as an answer
    pub fn note_canvas_from(&mut self, peer: &PeerId) {
        if let Some(sync) = self.full_sync.get_mut(peer) {
            sync.answered = true;
        }
    }

    /// Called when a full sync check fires
    pub fn full_sync_step(&mut self, peer: &PeerId) -> FullSyncStep {
        let Some(sync) = self.full_sync.get_mut(peer) else {
            return FullSyncStep::Done;
        };
        if sync.answered || sync.resent >= FULL_SYNC_RETRY.len() {
            self.full_sync.remove(peer);
            return FullSyncStep::Done;
        }

        sync.resent += 1;
        let next_check = FULL_SYNC_RETRY.get(sync.resent).copied();
        if next_check.is_none() {
            self.full_sync.remove(peer);
        }
        FullSyncStep::Resend { next_check }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(local: &str) -> StateSyncEngine {
        StateSyncEngine::new(
            AvatarState::new(PeerId::new(local), "Local", 0x3cb44b),
            &CanvasId::layout(4),
        )
    }

    fn update(canvas: &str, image: &[u8], at: u64) -> CanvasUpdate {
        CanvasUpdate {
            canvas_id: CanvasId::new(canvas),
            image_data: image.to_vec(),
            updated_at_millis: at,
        }
    }

    fn info(id: &str, name: &str) -> PlayerInfo {
        PlayerInfo {
            id: PeerId::new(id),
            username: name.to_string(),
            position: Vec3::new(1.0, 0.0, 2.0),
            rotation: 0.25,
            color: 0xe6194b,
        }
    }

    #[test]
    fn starts_with_every_slot_blank() {
        let engine = engine("me");
        assert_eq!(engine.canvases().len(), 16);
        assert!(engine.canvases().iter().all(CanvasState::is_blank));
        assert!(engine.canvas_snapshot().is_empty());
    }

    #[test]
    fn last_writer_wins_regardless_of_arrival_order() {
        let updates = vec![
            update("north-0", b"one", 100),
            update("north-0", b"three", 300),
            update("north-0", b"two", 200),
        ];

        let mut forward = engine("a");
        let mut backward = engine("b");
        for u in updates.iter().cloned() {
            forward.apply_canvas(u);
        }
        for u in updates.iter().rev().cloned() {
            backward.apply_canvas(u);
        }

        let id = CanvasId::new("north-0");
        assert_eq!(forward.canvas(&id), backward.canvas(&id));
        assert_eq!(forward.canvas(&id).unwrap().image, b"three".to_vec());
        assert_eq!(forward.canvas(&id).unwrap().updated_at_millis, 300);
    }

    #[test]
    fn applying_the_same_update_twice_is_idempotent() {
        let mut engine = engine("me");
        let u = update("east-1", b"img", 42);

        assert!(matches!(engine.apply_canvas(u.clone()), CanvasApply::Applied(_)));
        let after_first = engine.canvases();
        assert_eq!(engine.apply_canvas(u), CanvasApply::Stale);
        assert_eq!(engine.canvases(), after_first);
    }

    #[test]
    fn equal_timestamp_keeps_local_value() {
        let mut engine = engine("me");
        engine.apply_canvas(update("west-3", b"ours", 500));
        assert_eq!(
            engine.apply_canvas(update("west-3", b"theirs", 500)),
            CanvasApply::Stale
        );
        assert_eq!(
            engine.canvas(&CanvasId::new("west-3")).unwrap().image,
            b"ours".to_vec()
        );
    }

    #[test]
    fn unknown_canvas_is_not_created() {
        let mut engine = engine("me");
        assert_eq!(
            engine.apply_canvas(update("ceiling-0", b"x", 1)),
            CanvasApply::Unknown
        );
        assert!(engine.canvas(&CanvasId::new("ceiling-0")).is_none());
    }

    #[test]
    fn own_player_info_never_creates_an_avatar() {
        let mut engine = engine("me");
        assert_eq!(
            engine.apply_player_info(info("me", "Echo")),
            AvatarApply::Ignored
        );
        assert!(engine.avatars().is_empty());
    }

    #[test]
    fn repeated_player_info_updates_instead_of_duplicating() {
        let mut engine = engine("me");
        assert!(matches!(
            engine.apply_player_info(info("b", "Bob")),
            AvatarApply::Joined(_)
        ));
        assert!(matches!(
            engine.apply_player_info(info("b", "Bobby")),
            AvatarApply::Updated(_)
        ));
        assert_eq!(engine.avatars().len(), 1);
        assert_eq!(engine.avatars()[0].display_name, "Bobby");
    }

    #[test]
    fn moves_apply_immediately_and_create_placeholders() {
        let mut engine = engine("me");
        let b = PeerId::new("b");
        let mv = PlayerMove {
            position: Vec3::new(1.0, 0.0, 1.0),
            rotation: 0.5,
        };

        match engine.apply_move(&b, mv) {
            AvatarApply::Joined(avatar) => assert_eq!(avatar.display_name, "b"),
            other => panic!("Expected a placeholder, got {:?}", other),
        }

        engine.apply_player_info(info("b", "Bob"));
        engine.apply_move(&b, mv);
        let avatar = engine.avatar(&b).unwrap();
        assert_eq!(avatar.position, Vec3::new(1.0, 0.0, 1.0));
        assert_eq!(avatar.heading, 0.5);
        assert_eq!(avatar.display_name, "Bob");
    }

    #[test]
    fn broadcast_is_capped_at_ten_hertz_and_only_on_change() {
        let mut engine = engine("me");
        let start = Instant::now();

        // Initial pose is announced once
        assert!(engine.poll_broadcast(start).is_some());
        assert!(engine.poll_broadcast(start + Duration::from_millis(500)).is_none());

        engine.set_pose(Vec3::new(1.0, 0.0, 0.0), 0.0);
        assert!(engine.poll_broadcast(start + Duration::from_millis(50)).is_none());
        engine.set_pose(Vec3::new(2.0, 0.0, 0.0), 0.0);
        let sent = engine
            .poll_broadcast(start + Duration::from_millis(100))
            .unwrap();
        assert_eq!(sent.position, Vec3::new(2.0, 0.0, 0.0));

        // Same pose again is not a change
        engine.set_pose(Vec3::new(2.0, 0.0, 0.0), 0.0);
        assert!(engine.poll_broadcast(start + Duration::from_secs(1)).is_none());
    }

    #[test]
    fn non_finite_poses_are_ignored() {
        let mut engine = engine("me");
        let start = Instant::now();
        assert!(engine.poll_broadcast(start).is_some());

        engine.set_pose(Vec3::new(f32::NAN, 0.0, 0.0), 0.0);
        engine.set_pose(Vec3::new(1.0, 0.0, 0.0), f32::INFINITY);
        assert!(engine.poll_broadcast(start + Duration::from_secs(1)).is_none());
        assert_eq!(engine.local().position, Vec3::default());
        assert_eq!(engine.local().heading, 0.0);

        engine.set_pose(Vec3::new(1.0, 0.0, 0.0), 0.5);
        let sent = engine
            .poll_broadcast(start + Duration::from_secs(2))
            .unwrap();
        assert_eq!(sent.position, Vec3::new(1.0, 0.0, 0.0));
    }

    #[test]
    fn commit_stamps_and_applies_locally() {
        let mut engine = engine("me");
        let id = CanvasId::new("south-2");

        assert!(engine.begin_edit(&id).unwrap().is_blank());
        assert!(engine.is_editing(&id));

        let (update, outcome) = engine.commit_canvas(&id, b"drawing".to_vec(), 1_000).unwrap();
        assert_eq!(update.updated_at_millis, 1_000);
        assert!(matches!(outcome, CanvasApply::Applied(_)));
        assert!(!engine.is_editing(&id));
        assert_eq!(engine.canvas_snapshot(), vec![update]);
    }

    #[test]
    fn edits_of_unknown_canvases_are_not_found() {
        let mut engine = engine("me");
        let id = CanvasId::new("floor-0");
        assert!(matches!(engine.begin_edit(&id), Err(Error::NotFound(_))));
        assert!(matches!(
            engine.commit_canvas(&id, Vec::new(), 1),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn full_sync_is_resent_twice_then_given_up() {
        let mut engine = engine("me");
        let b = PeerId::new("b");

        let (request, first_check) = engine.begin_full_sync(&b);
        assert_eq!(request.requester_id, PeerId::new("me"));
        assert_eq!(first_check, Duration::from_secs(5));

        assert_eq!(
            engine.full_sync_step(&b),
            FullSyncStep::Resend {
                next_check: Some(Duration::from_secs(5))
            }
        );
        assert_eq!(
            engine.full_sync_step(&b),
            FullSyncStep::Resend { next_check: None }
        );
        assert_eq!(engine.full_sync_step(&b), FullSyncStep::Done);
    }

    #[test]
    fn answered_full_sync_stops_retrying() {
        let mut engine = engine("me");
        let b = PeerId::new("b");
        engine.begin_full_sync(&b);
        engine.note_canvas_from(&b);
        assert_eq!(engine.full_sync_step(&b), FullSyncStep::Done);
    }

    #[test]
    fn new_identity_keeps_pose_and_look() {
        let mut engine = engine("old");
        engine.set_pose(Vec3::new(3.0, 0.0, 4.0), 1.0);
        engine.apply_player_info(info("b", "Bob"));

        engine.set_local_id(PeerId::new("new"));
        assert_eq!(engine.clear_remote(), vec![PeerId::new("b")]);

        assert_eq!(engine.local_id(), &PeerId::new("new"));
        assert_eq!(engine.local().position, Vec3::new(3.0, 0.0, 4.0));
        assert_eq!(engine.local().color, 0x3cb44b);
        assert!(engine.avatars().is_empty());
    }
}
