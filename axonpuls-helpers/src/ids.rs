use nanoid::nanoid;

/// Generates cluster-unique identifiers: session ids, cross-server message
/// ids, migration ids and request ids. Message ids double as idempotency
/// keys for the cross-server message cache, so uniqueness here matters
/// beyond cosmetics.
pub trait IdGenerator: Send + Sync {
    fn generate(&self) -> String;
}

/// An id generator backed by `nanoid`, used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct NanoIdGenerator {}

impl NanoIdGenerator {
    pub fn new() -> Self {
        NanoIdGenerator {}
    }
}

impl IdGenerator for NanoIdGenerator {
    fn generate(&self) -> String {
        nanoid!()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_ids() {
        let gen = NanoIdGenerator::new();
        let a = gen.generate();
        let b = gen.generate();
        assert_ne!(a, b);
        assert!(!a.is_empty());
    }
}
