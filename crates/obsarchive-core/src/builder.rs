//! Schema builder: declares a group's table, auxiliary arrays and time index.

use log::info;
use snafu::prelude::*;

use crate::{
    catalog::{CatalogAction, RootAttrs},
    container::Container,
    error::{ArchiveResult, TableExistsSnafu},
    group::GroupPath,
    schema::GroupSchema,
};

impl Container {
    /// Declare `group` with `schema`.
    ///
    /// Creates missing intermediate namespaces, allocates the table (time at
    /// position 0 followed by the declared columns), declares each auxiliary
    /// array, records the root attributes on first build and the auxiliary
    /// name list on the group, then builds the time index.
    ///
    /// Fails with [`SchemaError::TableExists`](crate::SchemaError::TableExists)
    /// if the group already holds a table. The steps are written one after
    /// another; a failure part way through leaves the earlier steps in place.
    pub fn build(&mut self, group: &str, schema: &GroupSchema) -> ArchiveResult<()> {
        self.ensure_writable()?;
        let path = GroupPath::parse(group)?;
        schema.validate(&path)?;
        ensure!(
            !self.catalog.groups.contains_key(&path),
            TableExistsSnafu {
                group: path.to_string(),
            }
        );

        for ancestor in path.ancestors() {
            if !self.catalog.has_namespace(&ancestor) {
                self.commit_action(CatalogAction::CreateNamespace { path: ancestor })?;
            }
        }

        let group_id = self.catalog.next_group_id();
        self.commit_action(CatalogAction::CreateTable {
            group: path.clone(),
            group_id,
            schema: schema.table_schema(),
            compression: schema.compression,
        })?;

        for spec in &schema.aux {
            self.commit_action(CatalogAction::DeclareAux {
                group: path.clone(),
                spec: spec.clone(),
            })?;
        }

        if self.catalog.root.is_none() {
            self.commit_action(CatalogAction::SetRootAttrs(RootAttrs::current()))?;
        }

        self.commit_action(CatalogAction::SetGroupAttrs {
            group: path.clone(),
            aux_names: schema.aux.iter().map(|a| a.name.clone()).collect(),
        })?;
        self.commit_action(CatalogAction::CreateTimeIndex {
            group: path.clone(),
            auto_index: schema.auto_index,
        })?;

        info!(
            "built group {path} in {}: {} columns, {} auxiliary arrays, {:?}",
            self.path().display(),
            schema.columns.len(),
            schema.aux.len(),
            schema.compression
        );
        Ok(())
    }
}
