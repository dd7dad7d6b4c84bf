//! End-to-end tests for leveler. See `tests/`.
