//! Testing infrastructure for the relay and daemon
//!
//! Everything here runs without display hardware:
//!
//! 1. **TestBuffer**: a memfd-backed buffer object, so minted handles are real
//!    descriptors whose identity can be compared by inode.
//!
//! 2. **Fakes**: allocator, compositor and backlight collaborators that record
//!    every call for the daemon tests.
//!
//! 3. **RelayFixture**: a manually ticked relay device with one producer
//!    client, plus helpers to build framebuffers the daemon can import.
//!
//! # Example
//!
//! ```ignore
//! use membrane::testing::RelayFixture;
//!
//! #[test]
//! fn test_commit_reaches_active() {
//!     let fixture = RelayFixture::new();
//!     let fb = fixture.importable_framebuffer();
//!     fixture.commit_and_tick(&fb);
//!     assert!(fixture.device().has_active());
//! }
//! ```

mod fakes;
mod fixture;

pub use fakes::{
    CompositorCalls, FakeAllocator, FakeBacklight, FakeBuffer, FakeCompositor, ImportRecord,
    TestBuffer,
};
pub use fixture::RelayFixture;
