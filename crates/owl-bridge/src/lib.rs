//! Native bridge to a managed reasoning engine.
//!
//! The host runtime owns the formula and automaton machinery; this crate
//! owns everything needed to drive it safely from Rust: exactly-once
//! reference-unit accounting ([`handle`]), cached member resolution and
//! failure-drained invocation ([`call`]), a closed typed conversion surface
//! ([`codec`], [`tree`]), the root-exchange rendezvous with the host's
//! reclamation pass ([`roots`]), and typed facades over the engine
//! ([`facade`]), all scoped to an attached [`Session`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use owl_vm::fake::FakeVm;
//! use owl_bridge::Session;
//!
//! # fn main() -> owl_bridge::Result<()> {
//! let session = Session::attach(Arc::new(FakeVm::new()))?;
//! let factory = session.formula_factory();
//! let formula = factory.parse("G (req -> F grant)", &["req".into(), "grant".into()])?;
//! let automaton = session.automata().of(&formula)?;
//! println!("{:?}", session.automata().acceptance(&automaton)?);
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod codec;
pub mod error;
pub mod facade;
pub mod handle;
pub mod roots;
pub mod session;
pub mod tree;

pub use call::{BindingKey, CallBridge, MemberBinding};
pub use codec::{Codec, ConversionTag, ForeignClass, ForeignEnum, FromForeign, ToForeign};
pub use error::{BridgeError, Result};
pub use facade::{
    Acceptance, Automaton, AutomatonFactory, ConnectiveTag, Edge, Formula, FormulaFactory,
    FormulaRewriter,
};
pub use handle::{Handle, HandleRegistry, TypeDescriptor};
pub use roots::{RootExchangeCoordinator, RootSnapshot};
pub use session::Session;
pub use tree::LabelledTree;
