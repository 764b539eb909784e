//! The application-defined source of query data.
//!
//! A query names its select, filter and aggregate functions by opcode; the
//! application registers the actual functions here and owns their argument
//! encodings (argument buffers travel opaquely through the protocol).

use std::collections::HashMap;

use crate::Opcode;

/// Selects a single record from the local data, given serialised arguments.
pub type SelectFunction<R> = Box<dyn Fn(&[u8]) -> R + Send>;

/// Decides whether a selected record should be contributed at all.
pub type FilterFunction<R> = Box<dyn Fn(&R, &[u8]) -> bool + Send>;

/// Combines any number of records into one. Must tolerate an empty input
/// (a proxy whose accepted set is empty still reports).
pub type AggregateFunction<R> = Box<dyn Fn(&[R], &[u8]) -> R + Send>;

/// The per-client table of query functions.
///
/// The protocol engine borrows this read-only while handling aggregation
/// messages; the application may populate the underlying data from another
/// thread, but the function tables themselves are fixed after construction.
#[derive(Default)]
pub struct DataSource<R> {
    pub select_functions: HashMap<Opcode, SelectFunction<R>>,
    pub filter_functions: HashMap<Opcode, FilterFunction<R>>,
    pub aggregate_functions: HashMap<Opcode, AggregateFunction<R>>,
}

impl<R> DataSource<R> {
    pub fn new() -> Self {
        Self {
            select_functions: HashMap::new(),
            filter_functions: HashMap::new(),
            aggregate_functions: HashMap::new(),
        }
    }

    pub fn with_select(
        mut self,
        opcode: Opcode,
        function: impl Fn(&[u8]) -> R + Send + 'static,
    ) -> Self {
        self.select_functions.insert(opcode, Box::new(function));
        self
    }

    pub fn with_filter(
        mut self,
        opcode: Opcode,
        function: impl Fn(&R, &[u8]) -> bool + Send + 'static,
    ) -> Self {
        self.filter_functions.insert(opcode, Box::new(function));
        self
    }

    pub fn with_aggregate(
        mut self,
        opcode: Opcode,
        function: impl Fn(&[R], &[u8]) -> R + Send + 'static,
    ) -> Self {
        self.aggregate_functions.insert(opcode, Box::new(function));
        self
    }

    /// Runs the select function `opcode`, or `None` if it is not
    /// registered (the query is then ignored).
    pub fn select(&self, opcode: Opcode, args: &[u8]) -> Option<R> {
        self.select_functions.get(&opcode).map(|f| f(args))
    }

    pub fn filter(&self, opcode: Opcode, record: &R, args: &[u8]) -> Option<bool> {
        self.filter_functions.get(&opcode).map(|f| f(record, args))
    }

    pub fn aggregate(&self, opcode: Opcode, values: &[R], args: &[u8]) -> Option<R> {
        self.aggregate_functions.get(&opcode).map(|f| f(values, args))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum_source() -> DataSource<i64> {
        DataSource::new()
            .with_select(0, |args| args.first().copied().unwrap_or(0) as i64)
            .with_filter(0, |record, _| *record >= 0)
            .with_aggregate(0, |values, _| values.iter().sum())
    }

    #[test]
    fn dispatch_by_opcode() {
        let source = sum_source();
        assert_eq!(source.select(0, &[7]), Some(7));
        assert_eq!(source.select(1, &[7]), None);
        assert_eq!(source.filter(0, &-1, &[]), Some(false));
        assert_eq!(source.aggregate(0, &[1, 2, 3], &[]), Some(6));
    }

    #[test]
    fn aggregate_of_nothing_is_the_identity() {
        let source = sum_source();
        assert_eq!(source.aggregate(0, &[], &[]), Some(0));
    }
}
