//! Library surface for `siftmaild`: split out from `main.rs` so
//! `tests/` can drive the real router end-to-end (spec §8) the same way
//! `ferrex-server`'s own integration tests import `ferrex_server::...`.

pub mod app_state;
pub mod classifiers;
pub mod errors;
pub mod fuzzy_listener;
pub mod learn_cache;
pub mod routes;
pub mod rules;
