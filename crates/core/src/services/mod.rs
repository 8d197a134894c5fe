//! Business logic services.

pub mod aggregator;
pub mod pipeline;
pub mod reconciler;
pub mod session;

#[cfg(test)]
pub(crate) mod fakes;

pub use aggregator::{AggregatorConfig, AnnotationAggregator};
pub use pipeline::{AnnotationPipeline, Attempt, DonationState, PipelineConfig};
pub use reconciler::{ReconcilerConfig, TotalReconciler};
pub use session::{Clock, PublicationGuard, Session, SystemClock, TotalCell};
