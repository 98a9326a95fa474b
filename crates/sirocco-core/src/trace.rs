/// Sink for named value-change events (busy lines, per-channel activity, counter state).
///
/// Models publish a new value with `Some(v)` and release the signal with `None`. The
/// implementation belongs to the embedding framework (VCD writer, in-memory recorder,
/// nothing at all); the model crates only ever call into it.
pub trait TraceSink {
    fn value_change(&mut self, path: &str, value: Option<u64>);
}

/// Default sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTrace;

impl TraceSink for NullTrace {
    fn value_change(&mut self, _path: &str, _value: Option<u64>) {}
}
