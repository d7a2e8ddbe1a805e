// Database schema for the ledger and voting tables.
// Statements are idempotent so migrations can run on every start.

pub const LEDGER_SCHEMA: &str = include_str!("../../migrations/001_ledger.sql");
pub const VOTING_SCHEMA: &str = include_str!("../../migrations/002_voting.sql");

pub const MIGRATIONS: &[(&str, &str)] = &[
    ("001_ledger", LEDGER_SCHEMA),
    ("002_voting", VOTING_SCHEMA),
];
