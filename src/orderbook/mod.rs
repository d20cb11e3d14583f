// =============================================================================
// Order Book & Matching Engine (C6)
// =============================================================================

mod book;

pub use book::{BookManager, BookSnapshot, Level, MatchFill, MatchOutcome, OrderBook};
