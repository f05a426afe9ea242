use std::path::PathBuf;

pub const PAGE_SIZE: u32 = 4096;

/// State for one build invocation. Every component reads it and the
/// allocator mutates it; it is never shared between builds.
#[derive(Debug, Clone)]
pub struct Environment {
    pub org: u32,
    pub outdir: PathBuf,
    pub result: String,
    pub url_base: String,
    pub suppress_loader: bool,
}

impl Default for Environment {
    fn default() -> Self {
        Environment {
            org: 0,
            outdir: PathBuf::from("output"),
            result: String::new(),
            url_base: String::new(),
            suppress_loader: false,
        }
    }
}

impl Environment {
    /// Hands out the current cursor and advances it past the requested
    /// size plus four guard pages, rounded to the next page boundary.
    /// Call order defines placement order; bases are strictly increasing.
    pub fn allocate(&mut self, size: u32) -> u32 {
        let base = self.org;
        self.org += size + 4 * PAGE_SIZE;
        self.org = (self.org & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        base
    }

    pub fn set_org(&mut self, org: u32) {
        self.org = org;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_is_deterministic_and_increasing() {
        let mut a = Environment::default();
        let mut b = Environment::default();
        a.set_org(0x40_0000);
        b.set_org(0x40_0000);

        let sizes = [0xa0, 0x2000, 1, 0x1000];
        let bases_a: Vec<u32> = sizes.iter().map(|&s| a.allocate(s)).collect();
        let bases_b: Vec<u32> = sizes.iter().map(|&s| b.allocate(s)).collect();
        assert_eq!(bases_a, bases_b);
        for pair in bases_a.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn allocation_formula() {
        let mut env = Environment::default();
        env.set_org(0x40_0000);
        let first = env.allocate(0xa0);
        assert_eq!(first, 0x40_0000);
        // (c + s1 + 4 pages) rounded down to a page, plus one page
        let expected = ((0x40_0000 + 0xa0 + 4 * PAGE_SIZE) & !(PAGE_SIZE - 1)) + PAGE_SIZE;
        assert_eq!(env.allocate(1), expected);
        assert_eq!(expected, 0x40_5000);
    }

    #[test]
    fn allocations_never_overlap() {
        let mut env = Environment::default();
        env.set_org(0x10_0000);
        let sizes = [5u32, 4096, 8191, 1, 0x2_0000];
        let mut last_end = 0u32;
        for &size in sizes.iter() {
            let base = env.allocate(size);
            assert!(base >= last_end);
            last_end = base + size;
        }
    }
}
