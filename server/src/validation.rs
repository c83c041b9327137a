//! Anti-cheat checks for sprite/frame/position updates.

use crate::config::ServerConfig;
use crate::player::{Player, NO_TIMESTAMP};

/// Client frame rate the movement budget is computed against.
pub const FRAMES_PER_SECOND: f32 = 30.0;

/// Highest valid animation frame index.
pub const MAX_FRAME_INDEX: i32 = 10;

/// Outcome of validating a visual update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Update applied to the player's stored state.
    Accept,
    /// Implausible movement; the caller must send a FORCE_TELEPORT back to
    /// the stored position. No state was changed, and no kick happens.
    Corrected,
    /// Cheating or corrupt state; the caller must kick with this reason.
    Reject(&'static str),
}

/// The policy knobs the validator reads, split out of [`ServerConfig`] so
/// the checks stay a pure function of player state and policy.
#[derive(Debug, Clone, Copy)]
pub struct VisualPolicy {
    pub testing_mode: bool,
    pub kick_bad_movement: bool,
    pub speed_limit: f32,
}

impl From<&ServerConfig> for VisualPolicy {
    fn from(config: &ServerConfig) -> Self {
        VisualPolicy {
            testing_mode: config.testing_mode,
            kick_bad_movement: config.kick_bad_movement,
            speed_limit: config.speed_limit,
        }
    }
}

/// Sprites the client is allowed to display.
fn sprite_allowed(sprite: i32) -> bool {
    (1088..=1139).contains(&sprite) || (2373..=2376).contains(&sprite) || sprite == 2517
}

fn frame_allowed(frame: i32) -> bool {
    (0..=MAX_FRAME_INDEX).contains(&frame)
}

/// Checks a claimed sprite/frame/position update against the player's last
/// known state.
///
/// The allow-list check inspects the player's *stored* sprite and frame,
/// i.e. the values from before this update. Clients have always been
/// validated one packet late like this, and shipped clients rely on being
/// able to switch into a new sprite in the same packet that leaves the
/// allow-listed one, so the check point is kept as-is.
///
/// On [`Verdict::Accept`] the incoming values overwrite the stored ones; on
/// any other verdict the player is untouched.
pub fn validate_visuals(
    player: &mut Player,
    sprite_index: i32,
    frame_index: i32,
    x: f32,
    y: f32,
    now: i64,
    policy: &VisualPolicy,
) -> Verdict {
    if !policy.testing_mode
        && (!sprite_allowed(player.sprite_index) || !frame_allowed(player.frame_index))
    {
        return Verdict::Reject("Kicked for invalid visuals (may be a bug)");
    }

    if !x.is_finite() || !y.is_finite() {
        return Verdict::Reject("Kicked for invalid coordinates");
    }

    if player.last_move_packet_time != NO_TIMESTAMP {
        let elapsed_frames =
            ((now - player.last_move_packet_time) as f32 / 1000.0) * FRAMES_PER_SECOND;
        let allowed = elapsed_frames * policy.speed_limit;
        if (x - player.x).abs() > allowed || (y - player.y).abs() > allowed {
            if policy.kick_bad_movement {
                return Verdict::Reject("Kicked for invalid movement (may be a bug)");
            }
            return Verdict::Corrected;
        }
    }

    player.sprite_index = sprite_index;
    player.frame_index = frame_index;
    player.x = x;
    player.y = y;
    Verdict::Accept
}
