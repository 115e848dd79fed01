//! Migration definitions and the directory they are loaded from.
//!
//! A migrations directory holds one pair of files per version:
//!
//! ```text
//! 0001_create_users.up.sql
//! 0001_create_users.down.sql
//! 0002_add_email.up.sql
//! 0002_add_email.down.sql
//! ```
//!
//! The numeric prefix is the version. Units are ordered by that number, never
//! by the order the filesystem lists them in.
//!
//! A file is kept as one SQL body and executed as a whole, so trigger and
//! function bodies containing `;` need no special handling.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Direction, LoadError};

/// Version identifier of a migration unit.
pub type Version = i64;

/// One versioned schema change with its forward and reverse SQL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationUnit {
    version: Version,
    name: String,
    up: String,
    down: String,
}

impl MigrationUnit {
    /// Creates a unit. Each body may hold any number of statements.
    pub fn new(
        version: Version,
        name: impl Into<String>,
        up: impl Into<String>,
        down: impl Into<String>,
    ) -> Self {
        Self {
            version,
            name: name.into(),
            up: up.into(),
            down: down.into(),
        }
    }

    /// Returns the version.
    #[must_use]
    pub const fn version(&self) -> Version {
        self.version
    }

    /// Returns the human-readable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the SQL that applies this unit.
    #[must_use]
    pub fn up_sql(&self) -> &str {
        &self.up
    }

    /// Returns the SQL that reverts this unit; empty without a down file.
    #[must_use]
    pub fn down_sql(&self) -> &str {
        &self.down
    }

    /// Returns the SQL for the given direction.
    #[must_use]
    pub fn sql(&self, direction: Direction) -> &str {
        match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        }
    }
}

/// An ordered, validated snapshot of migration units.
///
/// Versions are unique and sorted ascending. The set never changes once built.
#[derive(Debug, Clone, Default)]
pub struct MigrationSet {
    units: Vec<MigrationUnit>,
}

impl MigrationSet {
    /// Builds a set, rejecting duplicate versions and sorting by version.
    ///
    /// # Errors
    ///
    /// Returns [`LoadError::DuplicateVersion`] if two units share a version.
    pub fn new(mut units: Vec<MigrationUnit>) -> Result<Self, LoadError> {
        units.sort_by_key(MigrationUnit::version);
        for pair in units.windows(2) {
            if pair[0].version == pair[1].version {
                return Err(LoadError::DuplicateVersion {
                    version: pair[0].version,
                    first: pair[0].name.clone(),
                    second: pair[1].name.clone(),
                });
            }
        }
        Ok(Self { units })
    }

    /// Returns the units in ascending version order.
    #[must_use]
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    /// Looks up a unit by version.
    #[must_use]
    pub fn get(&self, version: Version) -> Option<&MigrationUnit> {
        self.units
            .binary_search_by_key(&version, MigrationUnit::version)
            .ok()
            .map(|idx| &self.units[idx])
    }

    /// Returns whether a unit with this version exists.
    #[must_use]
    pub fn contains(&self, version: Version) -> bool {
        self.get(version).is_some()
    }

    /// Returns the number of units.
    #[must_use]
    pub fn len(&self) -> usize {
        self.units.len()
    }

    /// Returns whether the set has no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Loads migration units from a directory of `.up.sql`/`.down.sql` files.
#[derive(Debug, Clone)]
pub struct MigrationSource {
    dir: PathBuf,
}

/// A file name split into its parts.
#[derive(Debug, PartialEq, Eq)]
struct FileName {
    version: Version,
    name: String,
    direction: Direction,
}

/// A parsed migration file awaiting its counterpart.
struct Definition {
    file: String,
    name: String,
    sql: String,
}

impl MigrationSource {
    /// Creates a source reading from `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Returns the directory this source reads.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reads and validates every migration in the directory.
    ///
    /// # Errors
    ///
    /// Returns a [`LoadError`] if the directory or a file cannot be read, a
    /// `.sql` file is misnamed, or the up/down files do not pair up.
    pub fn load(&self) -> Result<MigrationSet, LoadError> {
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| LoadError::Io { path, source }
        };

        let mut ups: BTreeMap<Version, Definition> = BTreeMap::new();
        let mut downs: BTreeMap<Version, Definition> = BTreeMap::new();

        for entry in fs::read_dir(&self.dir).map_err(io_err(&self.dir))? {
            let entry = entry.map_err(io_err(&self.dir))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(file) = path.file_name().and_then(|f| f.to_str()) else {
                continue;
            };
            if !file.ends_with(".sql") {
                continue;
            }

            let parsed = parse_file_name(file)
                .ok_or_else(|| LoadError::InvalidFileName { path: path.clone() })?;
            let sql = fs::read_to_string(&path).map_err(io_err(&path))?;
            debug!(
                file,
                version = parsed.version,
                bytes = sql.len(),
                "Read migration file"
            );

            let target = match parsed.direction {
                Direction::Up => &mut ups,
                Direction::Down => &mut downs,
            };
            let definition = Definition {
                file: file.to_string(),
                name: parsed.name,
                sql,
            };
            if let Some(existing) = target.insert(parsed.version, definition) {
                let replaced = &target[&parsed.version];
                let (first, second) = if existing.file < replaced.file {
                    (existing.file, replaced.file.clone())
                } else {
                    (replaced.file.clone(), existing.file)
                };
                return Err(LoadError::DuplicateVersion {
                    version: parsed.version,
                    first,
                    second,
                });
            }
        }

        if let Some(&version) = downs.keys().find(|v| !ups.contains_key(v)) {
            return Err(LoadError::MissingUp { version });
        }

        let mut units = Vec::with_capacity(ups.len());
        for (version, up) in ups {
            let down = match downs.remove(&version) {
                Some(down) if down.name != up.name => {
                    return Err(LoadError::NameMismatch {
                        version,
                        up: up.name,
                        down: down.name,
                    });
                }
                Some(down) => down.sql,
                None => String::new(),
            };
            units.push(MigrationUnit::new(version, up.name, up.sql, down));
        }

        MigrationSet::new(units)
    }
}

/// Parses `<digits>[_|-<name>].(up|down).sql`.
fn parse_file_name(file: &str) -> Option<FileName> {
    let stem = file.strip_suffix(".sql")?;
    let (stem, direction) = if let Some(stem) = stem.strip_suffix(".up") {
        (stem, Direction::Up)
    } else {
        (stem.strip_suffix(".down")?, Direction::Down)
    };

    let digits = stem.find(|c: char| !c.is_ascii_digit()).unwrap_or(stem.len());
    if digits == 0 {
        return None;
    }
    let version = stem[..digits].parse::<Version>().ok()?;

    let rest = &stem[digits..];
    let name = if rest.is_empty() {
        String::new()
    } else {
        let name = rest.strip_prefix('_').or_else(|| rest.strip_prefix('-'))?;
        if name.is_empty() {
            return None;
        }
        name.to_string()
    };

    Some(FileName {
        version,
        name,
        direction,
    })
}
