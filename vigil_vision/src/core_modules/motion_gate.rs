// THEORY:
// The `motion_gate` is the cheapest decision in the pipeline and the one every
// other stage depends on. It asks a single question of the foreground mask: did
// "enough" of the frame change? Only when the answer is yes does the pipeline pay
// for localization, tracking and recording.
//
// The threshold is a sensitivity knob and must sit above the noise floor of the
// background operator in use: too low and sensor noise opens the gate, too high
// and slow-moving subjects never do.

use crate::core_modules::frame::ForegroundMask;

/// Default occupancy threshold, in cells.
pub const DEFAULT_OCCUPANCY_THRESHOLD: usize = 10;

/// Returns true iff the number of non-zero mask cells is strictly greater than
/// `threshold`. An empty mask is never occupied.
pub fn is_occupied(mask: &ForegroundMask, threshold: usize) -> bool {
    if mask.is_empty() {
        return false;
    }
    mask.occupancy() > threshold
}
