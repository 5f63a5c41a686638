//! End-to-end tests for the control surface live under `tests/`.
