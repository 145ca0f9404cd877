pub mod draft;
pub mod engine;
pub mod states;
pub mod variance;

pub use draft::{LineItemDraft, NewLineItem, NewRequest, RequestDraft, ValidationError};
pub use engine::{LifecycleEngine, PurchaseInput, Submission};
pub use states::{LifecycleAction, RequiredInput, TransitionOutcome};
pub use variance::Variance;
