//! Stateless model checker core for concurrent programs running under an
//! instrumented simulator. The embedder owns the machine; it feeds every
//! executed instruction, memory access, and exception into
//! [`engine::Engine::on_event`], and the engine steers the simulation
//! through the [`machine::Machine`] trait: perturbing thread scheduling at
//! preemption points, checkpointing into a choice tree, and rewinding to
//! explore the interleavings dynamic partial-order reduction tags as
//! worth exploring.

#[macro_use]
extern crate bitflags;
#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate static_assertions;

#[macro_use]
pub mod log;

pub mod arbiter;
pub mod dpor;
pub mod engine;
pub mod estimate;
pub mod explore;
pub mod found_a_bug;
pub mod lockset;
pub mod machine;
pub mod memory;
pub mod messaging;
pub mod pp;
pub mod profile;
pub mod save;
pub mod schedule;
pub mod sorted_vec;
pub mod stack;
pub mod testcase;
pub mod tree;
pub mod user_sync;
pub mod vector_clock;

pub use crate::engine::{Engine, EngineConfig};
pub use crate::machine::{Event, Machine};
pub use crate::messaging::{InputMessage, JobChannel, OutputMessage};
pub use crate::profile::GuestProfile;
