//! Cross-module tests: mock hardware, end-to-end scenarios, invariant
//! exploration, and writer contention.

mod invariants;
mod scenarios;
