// Parse-state and recovery-cost constants.

use crate::StateId;

/// State id reserved for error recovery. State `0` is the initial state, so
/// the error state sits at the other end of the id space.
pub const ERROR_STATE: StateId = StateId::MAX;

/// Cost charged to a head for each recovery it has started.
pub const ERROR_COST_PER_RECOVERY: u32 = 500;
