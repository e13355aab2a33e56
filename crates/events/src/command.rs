use finflow_core::AggregateId;

/// A command targets exactly one aggregate stream.
///
/// The stream is the transaction boundary: everything a command decides
/// (e.g. "accept bid B and reject every rival") commits together or not at all.
pub trait Command: Clone + core::fmt::Debug + Send + Sync + 'static {
    fn target_aggregate_id(&self) -> AggregateId;
}
