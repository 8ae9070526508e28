//! Mock/test-case stores and the matching primitives shared by every
//! protocol handler.
//!
//! The store is the single arbitration point for replay: any number of
//! matchers may read snapshots concurrently, but consuming a mock goes
//! through `delete_filtered`, which succeeds for exactly one caller.

pub mod fuzzy;
pub mod noise;
pub mod store;

pub use fuzzy::{adaptive_k, is_ascii_printable, jaccard_similarity, levenshtein, shingles};
pub use noise::response_matches_with_noise;
pub use store::{InMemoryMockStore, InMemoryTestStore, MockStore, TestStore};
