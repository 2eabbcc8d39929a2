//! Kernel symbol table lookup
//!
//! Reads function names from `/proc/kallsyms`. Only names matter here, so
//! the table works even when `kptr_restrict` zeroes the addresses.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufRead, BufReader};

const KALLSYMS: &str = "/proc/kallsyms";

/// Set of kernel text symbols
#[derive(Debug, Default, Clone)]
pub struct KernelSymbols {
    names: HashSet<String>,
}

impl KernelSymbols {
    /// Load the running kernel's symbol table
    ///
    /// # Errors
    /// Returns an error if `/proc/kallsyms` cannot be read
    pub fn from_kallsyms() -> io::Result<Self> {
        Self::parse(BufReader::new(File::open(KALLSYMS)?))
    }

    /// Parse `kallsyms` formatted lines: `<addr> <type> <name> [module]`
    ///
    /// Only text symbols (`t`/`T`) are kept; those are the attachable ones.
    ///
    /// # Errors
    /// Returns an error if reading fails
    pub fn parse<R: BufRead>(reader: R) -> io::Result<Self> {
        let mut names = HashSet::new();
        for line in reader.lines() {
            let line = line?;
            let mut fields = line.split_whitespace();
            let (Some(_addr), Some(kind), Some(name)) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            if kind.eq_ignore_ascii_case("t") {
                names.insert(name.to_string());
            }
        }
        Ok(Self { names })
    }

    #[must_use]
    pub fn contains(&self, symbol: &str) -> bool {
        self.names.contains(symbol)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for KernelSymbols {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self { names: iter.into_iter().map(Into::into).collect() }
    }
}
