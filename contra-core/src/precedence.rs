use std::collections::BTreeMap;

/// Binary operator precedence table shared with a front end. Higher binds
/// tighter; 1 is the lowest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BinopPrecedence {
    table: BTreeMap<char, u32>,
}

impl Default for BinopPrecedence {
    fn default() -> Self {
        let table = [('=', 2), ('<', 10), ('+', 20), ('-', 20), ('*', 40), ('/', 50)]
            .into_iter()
            .collect();
        Self { table }
    }
}

impl BinopPrecedence {
    pub fn get(&self, op: char) -> Option<u32> {
        self.table.get(&op).copied()
    }

    pub fn insert(&mut self, op: char, precedence: u32) -> Option<u32> {
        self.table.insert(op, precedence)
    }
}
