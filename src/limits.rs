/// Max units in one batch request.
pub const MAX_BATCH_SIZE: usize = 50;

/// Max byte length of a unit, actor or sub-task identifier.
pub const MAX_ID_LEN: usize = 256;

/// Max sub-task tracks on a single unit.
pub const MAX_SUBTASKS_PER_UNIT: usize = 32;

/// Max units held by the in-memory record store.
pub const MAX_UNITS: usize = 1_000_000;

/// Max length of one line on the wire.
pub const MAX_LINE_LEN: usize = 64 * 1024;
