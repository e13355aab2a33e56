/// Execute an aggregate command in place (decide, then apply).
///
/// No persistence or publication; the dispatcher in `finflow-infra` wraps the
/// same two steps with load/append/publish. Used directly by domain tests.
pub fn execute<A>(aggregate: &mut A, command: &A::Command) -> Result<Vec<A::Event>, A::Error>
where
    A: finflow_core::Aggregate,
{
    let events = A::handle(aggregate, command)?;
    for ev in &events {
        A::apply(aggregate, ev);
    }
    Ok(events)
}
