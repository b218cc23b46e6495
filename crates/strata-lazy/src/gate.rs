/// Veto capability consulted before any clear of a handle, explicit or
/// sweep-driven.
///
/// A handle holds its gates weakly: the owning structure (a lazy collection
/// segment, a transaction scope) keeps the gate alive for exactly as long as
/// its veto matters. A dropped or absent gate allows clearing.
pub trait ClearGate: Send + Sync {
    fn allow_clear(&self) -> bool;
}
