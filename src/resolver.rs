//! Dependency Resolver
//!
//! Turns the manifest's table list into a foreign-key-safe emission order.
//! Tables referenced by a listed table but missing from the manifest are
//! discovered while resolving and dumped with default settings.
//!
//! The resolver keeps a FIFO queue of names awaiting a readiness check. A
//! table whose referenced tables are still pending is deferred: the pending
//! dependencies go to the front of the queue, followed by the table itself,
//! so the table is checked again once they have been emitted.

use crate::error::{DumpError, DumpResult, SchemaPhase};
use crate::introspection::SchemaIntrospector;
use crate::manifest::{Manifest, TableSpec};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// Lazy, foreign-key-ordered sequence of table specs
pub struct DependencyResolver<'a, I: ?Sized> {
    introspector: &'a I,
    /// Known tables not yet emitted
    pending: HashMap<String, TableSpec>,
    /// Emitted tables
    done: HashSet<String>,
    /// Names awaiting a readiness check
    queue: VecDeque<String>,
    /// Tables deferred since the last emission, in deferral order
    deferred_chain: Vec<String>,
    synthesized: usize,
}

impl<'a, I> DependencyResolver<'a, I>
where
    I: SchemaIntrospector + ?Sized,
{
    pub fn new(manifest: &Manifest, introspector: &'a I) -> Self {
        let mut pending = HashMap::with_capacity(manifest.tables.len());
        let mut queue = VecDeque::with_capacity(manifest.tables.len());
        for spec in &manifest.tables {
            if pending.insert(spec.table.clone(), spec.clone()).is_some() {
                warn!("Table {} is listed more than once, using the last entry", spec.table);
            }
            queue.push_back(spec.table.clone());
        }

        Self {
            introspector,
            pending,
            done: HashSet::new(),
            queue,
            deferred_chain: Vec::new(),
            synthesized: 0,
        }
    }

    /// Next table whose dependencies have all been emitted
    ///
    /// Returns `Ok(None)` once every known table has been emitted.
    pub async fn next(&mut self) -> DumpResult<Option<TableSpec>> {
        while let Some(table) = self.queue.pop_front() {
            if !self.pending.contains_key(&table) {
                continue;
            }

            let deps = self
                .introspector
                .referenced_tables_of(&table)
                .await
                .map_err(|source| DumpError::Schema {
                    table: table.clone(),
                    phase: SchemaPhase::ForeignKeys,
                    source,
                })?;

            let mut outstanding = Vec::new();
            for dep in deps {
                if !self.pending.contains_key(&dep) && !self.done.contains(&dep) {
                    warn!(
                        "Table {} is not in the manifest but {} references it, dumping it in full",
                        dep, table
                    );
                    self.pending.insert(dep.clone(), TableSpec::synthesized(dep.as_str()));
                    self.synthesized += 1;
                }
                if dep != table && self.pending.contains_key(&dep) && !outstanding.contains(&dep) {
                    outstanding.push(dep);
                }
            }

            if !outstanding.is_empty() {
                self.defer(table, outstanding)?;
                continue;
            }

            self.deferred_chain.clear();
            if let Some(spec) = self.pending.remove(&table) {
                self.done.insert(table);
                return Ok(Some(spec));
            }
        }

        Ok(None)
    }

    /// Requeue `table` behind the dependencies it is waiting on
    fn defer(&mut self, table: String, outstanding: Vec<String>) -> DumpResult<()> {
        // Consecutive deferrals walk a dependency path, so meeting a table
        // twice before anything is emitted means the path loops.
        if let Some(start) = self.deferred_chain.iter().position(|t| *t == table) {
            let mut cycle = self.deferred_chain.split_off(start);
            cycle.push(table);
            return Err(DumpError::DependencyCycle { cycle });
        }

        debug!("Deferring {} until {:?} are dumped", table, outstanding);
        self.deferred_chain.push(table.clone());

        self.queue.push_front(table);
        for dep in outstanding.into_iter().rev() {
            self.queue.push_front(dep);
        }
        Ok(())
    }

    /// Number of tables pulled in that the manifest did not list
    pub fn synthesized(&self) -> usize {
        self.synthesized
    }
}
