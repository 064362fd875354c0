//! State shared by one compilation and genesis customization.

use std::collections::HashMap;

/// Per-run state threaded through the compiler and the genesis mutator.
///
/// Each run owns its own context, so two runs in one process never see each
/// other's names or bonds.
#[derive(Debug, Default, Clone)]
pub struct CompilationContext {
    used_names: HashMap<String, usize>,
    /// Bond of the first staker found in the relay chain spec.
    pub default_bond: Option<u128>,
    /// Bond of the first parachain staking candidate.
    pub para_bond: Option<u128>,
}

impl CompilationContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `name` on first use and `name-1`, `name-2`, ... afterwards.
    ///
    /// Generated names are reserved too, so a later request for `name-1`
    /// never collides with one handed out earlier.
    pub fn unique_name(&mut self, name: &str) -> String {
        let Some(count) = self.used_names.get(name).copied() else {
            self.used_names.insert(name.to_string(), 1);
            return name.to_string();
        };
        let mut next = count;
        let mut unique = format!("{name}-{next}");
        while self.used_names.contains_key(&unique) {
            next += 1;
            unique = format!("{name}-{next}");
        }
        self.used_names.insert(name.to_string(), next + 1);
        self.used_names.insert(unique.clone(), 1);
        unique
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_names() {
        let mut ctx = CompilationContext::new();
        assert_eq!(ctx.unique_name("alice"), "alice");
        assert_eq!(ctx.unique_name("alice"), "alice-1");
        assert_eq!(ctx.unique_name("bob"), "bob");
        assert_eq!(ctx.unique_name("alice"), "alice-2");
    }

    #[test]
    fn test_generated_names_are_reserved() {
        let mut ctx = CompilationContext::new();
        assert_eq!(ctx.unique_name("alice"), "alice");
        assert_eq!(ctx.unique_name("alice"), "alice-1");
        assert_eq!(ctx.unique_name("alice-1"), "alice-1-1");

        let mut ctx = CompilationContext::new();
        assert_eq!(ctx.unique_name("bob-1"), "bob-1");
        assert_eq!(ctx.unique_name("bob"), "bob");
        assert_eq!(ctx.unique_name("bob"), "bob-2");
        assert_eq!(ctx.unique_name("bob"), "bob-3");
    }

    #[test]
    fn test_contexts_are_independent() {
        let mut first = CompilationContext::new();
        let mut second = CompilationContext::new();
        first.default_bond = Some(10);
        assert_eq!(first.unique_name("collator"), "collator");
        assert_eq!(second.unique_name("collator"), "collator");
        assert_eq!(second.default_bond, None);
    }
}
