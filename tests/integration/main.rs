//! Integration tests: full reconciliation cycles against an in-memory
//! exchange, with the ledger held in memory or on disk.

mod mock_exchange;
mod reconciliation;
