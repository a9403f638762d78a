//! Reconciliation engine for heir module state.
//!
//! Data flows one way: a trigger bumps the [`ReconciliationScope`] epoch, the
//! [`ModuleStateResolver`] re-reads the chain, results are committed only if
//! their epoch is still current, and the [`CountdownEngine`] derives per-row
//! display and claim state from the committed snapshot. The
//! [`ActionDispatcher`] submits mutations and asks for a fresh pass when they
//! settle.

pub mod clock;
pub mod countdown;
pub mod dispatcher;
pub mod error;
pub mod preference;
pub mod reconciler;
pub mod resolver;
pub mod scope;
pub mod wallet;

pub use clock::{ManualClock, SystemClock, WallClock};
pub use countdown::{
    derive_phase, format_remaining, ChainTimeSample, CountdownEngine, CountdownPhase,
    PollTransition, RowView,
};
pub use dispatcher::{
    ActionDispatcher, ActionKind, ActionOutcome, ActionUpdate, ContractInstruction,
    InstallPlan, InstructionReason, RemoveStrategy,
};
pub use error::{DispatchError, ResolveError, WalletError};
pub use preference::PreferenceStore;
pub use reconciler::{
    reconcile_pass, DisplayState, PassOutcome, Reconciler, ReconcilerHandle, ReaderProvider,
    Trigger,
};
pub use resolver::{is_module_enabled, EnabledCheck, ModuleStateResolver, NetworkContext, ResolvedModule};
pub use scope::{EpochToken, ReconciledState, ReconciliationScope};
pub use wallet::{TxRequest, TxSettlement, WalletCapability, WalletEvent};
