/// Byte range into the source of the compilation unit. The IR is built by an
/// earlier stage; we only thread spans through so diagnostics can point back
/// at the original program.
pub type Span = std::ops::Range<usize>;

#[macro_export]
macro_rules! dummy_span {
    () => {
        0..0
    };
}
