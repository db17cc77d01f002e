//! Catalog actions and the in-memory view rebuilt from them.
//!
//! Every structural change to a container (root attributes, namespaces,
//! tables, auxiliary declarations, group attributes, index settings) is
//! written as one JSON-encoded [`CatalogAction`] frame. Opening a container
//! replays those actions in file order, interleaved with row and auxiliary
//! data frames, to rebuild a [`Catalog`].
//!
//! Actions are validated against the current catalog before they are written,
//! so a replay of a well-formed file never fails on an action.
//!
//! Schema build writes several actions in sequence and is not atomic: a crash
//! between them leaves a partially declared group (for example a table with
//! no time index yet). Such a group still opens and its rows are still
//! queryable; only the missing pieces are absent.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use snafu::prelude::*;

use crate::{
    error::{
        CatalogError, DuplicateAuxSnafu, DuplicateTableSnafu, MissingTableSnafu,
        ReusedGroupIdSnafu, UndeclaredAuxSnafu,
    },
    group::GroupPath,
    index::TimeIndex,
    schema::{AuxSpec, Compression, TableSchema},
    storage::frame::FrameRef,
};

/// Format version recorded in the root attributes.
pub const FORMAT_VERSION: &str = "1.0";

/// Creator tag recorded in the root attributes.
pub fn creator_tag() -> String {
    format!("obsarchive v{}", env!("CARGO_PKG_VERSION"))
}

/// Attributes stored on the container root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootAttrs {
    /// Software that created the container.
    pub creator: String,
    /// Format version string.
    pub format_version: String,
    /// When the attributes were first recorded.
    pub created_at: DateTime<Utc>,
}

impl RootAttrs {
    pub(crate) fn current() -> Self {
        Self {
            creator: creator_tag(),
            format_version: FORMAT_VERSION.to_string(),
            created_at: Utc::now(),
        }
    }
}

/// One structural change recorded in the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CatalogAction {
    /// Record creator and format version on the root.
    SetRootAttrs(RootAttrs),

    /// Declare a plain namespace (an intermediate group without a table).
    CreateNamespace {
        /// Namespace path.
        path: GroupPath,
    },

    /// Allocate a group's table.
    CreateTable {
        /// Group that owns the table.
        group: GroupPath,
        /// Compact id used by row and aux frames.
        group_id: u32,
        /// Value columns after `time`.
        schema: TableSchema,
        /// Codec for row cells and aux data.
        compression: Compression,
    },

    /// Declare an auxiliary array.
    DeclareAux {
        /// Owning group.
        group: GroupPath,
        /// Name and shape.
        spec: AuxSpec,
    },

    /// Record the ordered auxiliary array names on the group.
    SetGroupAttrs {
        /// Target group.
        group: GroupPath,
        /// Auxiliary array names in declaration order.
        aux_names: Vec<String>,
    },

    /// Build the clustered time index.
    CreateTimeIndex {
        /// Target group.
        group: GroupPath,
        /// Refresh the index on every append.
        auto_index: bool,
    },

    /// Toggle auto-indexing.
    SetAutoIndex {
        /// Target group.
        group: GroupPath,
        /// New setting.
        auto_index: bool,
    },
}

/// Row directory: times and frame locations by row id (append order).
#[derive(Debug, Clone, Default)]
pub(crate) struct RowDirectory {
    pub times: Vec<i64>,
    pub frames: Vec<FrameRef>,
}

impl RowDirectory {
    pub(crate) fn len(&self) -> usize {
        self.times.len()
    }

    pub(crate) fn push(&mut self, time: i64, frame: FrameRef) {
        self.times.push(time);
        self.frames.push(frame);
    }
}

#[derive(Debug, Clone)]
pub(crate) struct AuxState {
    pub spec: AuxSpec,
    /// Most recent data frame; `None` until first written.
    pub latest: Option<FrameRef>,
}

#[derive(Debug, Clone)]
pub(crate) struct GroupState {
    pub id: u32,
    pub path: GroupPath,
    pub schema: TableSchema,
    pub compression: Compression,
    pub aux: BTreeMap<String, AuxState>,
    pub aux_names: Vec<String>,
    pub has_time_index: bool,
    pub auto_index: bool,
    pub rows: RowDirectory,
    pub index: TimeIndex,
}

impl GroupState {
    fn new(id: u32, path: GroupPath, schema: TableSchema, compression: Compression) -> Self {
        Self {
            id,
            path,
            schema,
            compression,
            aux: BTreeMap::new(),
            aux_names: Vec::new(),
            has_time_index: false,
            auto_index: false,
            rows: RowDirectory::default(),
            index: TimeIndex::default(),
        }
    }

    pub(crate) fn is_aux(&self, name: &str) -> bool {
        self.aux_names.iter().any(|n| n == name)
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Catalog {
    pub root: Option<RootAttrs>,
    pub namespaces: BTreeSet<GroupPath>,
    pub groups: BTreeMap<GroupPath, GroupState>,
    pub by_id: HashMap<u32, GroupPath>,
}

impl Catalog {
    /// Apply one action. Invalid actions are rejected before any mutation.
    pub(crate) fn apply(&mut self, action: CatalogAction) -> Result<(), CatalogError> {
        match action {
            CatalogAction::SetRootAttrs(attrs) => {
                self.root = Some(attrs);
            }
            CatalogAction::CreateNamespace { path } => {
                self.namespaces.insert(path);
            }
            CatalogAction::CreateTable {
                group,
                group_id,
                schema,
                compression,
            } => {
                ensure!(
                    !self.groups.contains_key(&group),
                    DuplicateTableSnafu {
                        group: group.to_string(),
                    }
                );
                ensure!(
                    !self.by_id.contains_key(&group_id),
                    ReusedGroupIdSnafu {
                        group_id,
                        group: group.to_string(),
                    }
                );
                self.namespaces.insert(group.clone());
                self.by_id.insert(group_id, group.clone());
                let state = GroupState::new(group_id, group.clone(), schema, compression);
                self.groups.insert(group, state);
            }
            CatalogAction::DeclareAux { group, spec } => {
                let state = self.group_mut(&group)?;
                let taken = state.aux.contains_key(&spec.name)
                    || state.schema.column(&spec.name).is_some();
                ensure!(
                    !taken,
                    DuplicateAuxSnafu {
                        group: group.to_string(),
                        name: spec.name.clone(),
                    }
                );
                state
                    .aux
                    .insert(spec.name.clone(), AuxState { spec, latest: None });
            }
            CatalogAction::SetGroupAttrs { group, aux_names } => {
                let state = self.group_mut(&group)?;
                if let Some(missing) = aux_names.iter().find(|n| !state.aux.contains_key(*n)) {
                    return UndeclaredAuxSnafu {
                        group: group.to_string(),
                        name: missing.clone(),
                    }
                    .fail();
                }
                state.aux_names = aux_names;
            }
            CatalogAction::CreateTimeIndex { group, auto_index } => {
                let state = self.group_mut(&group)?;
                state.has_time_index = true;
                state.auto_index = auto_index;
                state.index.rebuild_full(&state.rows.times);
            }
            CatalogAction::SetAutoIndex { group, auto_index } => {
                let state = self.group_mut(&group)?;
                state.auto_index = auto_index;
            }
        }
        Ok(())
    }

    pub(crate) fn next_group_id(&self) -> u32 {
        self.by_id.keys().max().map_or(0, |id| id + 1)
    }

    pub(crate) fn has_namespace(&self, path: &GroupPath) -> bool {
        path.is_root() || self.namespaces.contains(path)
    }

    pub(crate) fn group_by_id_mut(&mut self, id: u32) -> Option<&mut GroupState> {
        let path = self.by_id.get(&id)?;
        self.groups.get_mut(path)
    }

    fn group_mut(&mut self, group: &GroupPath) -> Result<&mut GroupState, CatalogError> {
        self.groups.get_mut(group).context(MissingTableSnafu {
            group: group.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::GroupSchema;

    fn path(p: &str) -> GroupPath {
        GroupPath::parse(p).expect("valid group")
    }

    fn create_table(group: &str, id: u32) -> CatalogAction {
        CatalogAction::CreateTable {
            group: path(group),
            group_id: id,
            schema: GroupSchema::new().column("bs", [250]).table_schema(),
            compression: Compression::None,
        }
    }

    type TestResult = Result<(), Box<dyn std::error::Error>>;

    #[test]
    fn replay_builds_group_state() -> TestResult {
        let mut catalog = Catalog::default();
        catalog.apply(CatalogAction::CreateNamespace { path: path("/site") })?;
        catalog.apply(create_table("/site/ct12", 0))?;
        catalog.apply(CatalogAction::DeclareAux {
            group: path("/site/ct12"),
            spec: AuxSpec::new("height", [250]),
        })?;
        catalog.apply(CatalogAction::SetGroupAttrs {
            group: path("/site/ct12"),
            aux_names: vec!["height".to_string()],
        })?;
        catalog.apply(CatalogAction::CreateTimeIndex {
            group: path("/site/ct12"),
            auto_index: true,
        })?;

        let g = &catalog.groups[&path("/site/ct12")];
        assert!(g.auto_index && g.has_time_index);
        assert!(g.is_aux("height"));
        assert!(catalog.has_namespace(&path("/site")));
        assert_eq!(catalog.next_group_id(), 1);
        Ok(())
    }

    #[test]
    fn duplicate_table_and_undeclared_aux_are_rejected() -> TestResult {
        let mut catalog = Catalog::default();
        catalog.apply(create_table("/a", 0))?;
        assert!(matches!(
            catalog.apply(create_table("/a", 1)),
            Err(CatalogError::DuplicateTable { .. })
        ));
        assert!(matches!(
            catalog.apply(create_table("/b", 0)),
            Err(CatalogError::ReusedGroupId { group_id: 0, .. })
        ));
        assert!(matches!(
            catalog.apply(CatalogAction::SetGroupAttrs {
                group: path("/a"),
                aux_names: vec!["ghost".to_string()],
            }),
            Err(CatalogError::UndeclaredAux { .. })
        ));
        assert!(matches!(
            catalog.apply(CatalogAction::DeclareAux {
                group: path("/a"),
                spec: AuxSpec::new("bs", [250]),
            }),
            Err(CatalogError::DuplicateAux { .. })
        ));
        assert!(matches!(
            catalog.apply(CatalogAction::SetAutoIndex {
                group: path("/missing"),
                auto_index: false,
            }),
            Err(CatalogError::MissingTable { .. })
        ));
        assert!(!catalog.groups.contains_key(&path("/b")));
        Ok(())
    }

    #[test]
    fn actions_serialize_as_tagged_json() -> TestResult {
        let action = CatalogAction::SetAutoIndex {
            group: path("/a"),
            auto_index: false,
        };
        let json = serde_json::to_string(&action)?;
        assert_eq!(json, r#"{"SetAutoIndex":{"group":"/a","auto_index":false}}"#);
        let back: CatalogAction = serde_json::from_str(&json)?;
        assert_eq!(back, action);
        Ok(())
    }
}
