/// A test case that can be written to a target's standard input.
pub trait Input: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn as_bytes(&self) -> &[u8];
}

impl Input for String {
    fn as_bytes(&self) -> &[u8] {
        str::as_bytes(self)
    }
}
