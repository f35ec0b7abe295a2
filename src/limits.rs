//! Hard caps on caller-supplied input. Anything past these is rejected as a
//! validation error before it reaches the store.

pub const MAX_NOTES_LEN: usize = 1_000;
pub const MAX_REQUESTER_LEN: usize = 128;
pub const MAX_SQL_LEN: usize = 16 * 1024;
pub const MAX_POOLS: usize = 10_000;
pub const MAX_UNITS_PER_KIND: u32 = 512;
pub const MAX_POOL_NAME_LEN: usize = 256;
