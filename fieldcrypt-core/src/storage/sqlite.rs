//! SQLite implementation of [`EncryptedColumnSource`]

use rusqlite::types::{ToSql, ToSqlOutput};
use rusqlite::{params, Connection, Row};

use super::{validate_identifier, EncryptedColumnSource, ModelRegistry, PkValue, RawRecord, StorageError};

impl ToSql for PkValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            PkValue::Integer(v) => v.to_sql(),
            PkValue::Text(v) => v.to_sql(),
        }
    }
}

#[derive(Debug, Clone)]
struct ColumnInfo {
    name: String,
    decl_type: String,
    pk_position: i64,
}

fn table_info(conn: &Connection, table: &str) -> Result<Vec<ColumnInfo>, StorageError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnInfo {
                name: row.get(1)?,
                decl_type: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                pk_position: row.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(columns)
}

/// One encrypted column of one table, walked in primary-key order.
///
/// The source borrows the connection so that job checkpoints written through
/// the same connection share its transactions.
pub struct SqliteColumnSource<'c> {
    conn: &'c Connection,
    model: String,
    table: String,
    column: String,
    pk: String,
    pk_is_integer: bool,
}

impl<'c> SqliteColumnSource<'c> {
    /// Resolve `model.column` through the registry
    pub fn open(
        conn: &'c Connection,
        registry: &ModelRegistry,
        model: &str,
        column: &str,
    ) -> Result<Self, StorageError> {
        let spec = registry.resolve(model, column)?;
        Self::for_table(conn, model, &spec.table, column)
    }

    /// Bind directly to a table, discovering its single-column primary key
    pub fn for_table(
        conn: &'c Connection,
        model: &str,
        table: &str,
        column: &str,
    ) -> Result<Self, StorageError> {
        validate_identifier(table)?;
        validate_identifier(column)?;

        let info = table_info(conn, table)?;
        if info.is_empty() {
            return Err(StorageError::UnknownTable(table.to_string()));
        }
        if !info.iter().any(|c| c.name.eq_ignore_ascii_case(column)) {
            return Err(StorageError::UnknownColumn {
                model: model.to_string(),
                column: column.to_string(),
            });
        }

        let mut keys: Vec<&ColumnInfo> = info.iter().filter(|c| c.pk_position > 0).collect();
        keys.sort_by_key(|c| c.pk_position);

        let pk = match keys.as_slice() {
            [] => return Err(StorageError::NoPrimaryKey(table.to_string())),
            [single] => *single,
            many => {
                return Err(StorageError::CompositePrimaryKey {
                    table: table.to_string(),
                    columns: many.iter().map(|c| c.name.clone()).collect(),
                })
            }
        };

        Ok(Self {
            conn,
            model: model.to_string(),
            table: table.to_string(),
            column: column.to_string(),
            pk: pk.name.clone(),
            pk_is_integer: pk.decl_type.to_ascii_uppercase().contains("INT"),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    fn read_record(&self, row: &Row<'_>) -> rusqlite::Result<RawRecord> {
        let pk = if self.pk_is_integer {
            PkValue::Integer(row.get(0)?)
        } else {
            PkValue::Text(row.get(0)?)
        };
        Ok(RawRecord {
            pk,
            value: row.get(1)?,
        })
    }
}

impl EncryptedColumnSource for SqliteColumnSource<'_> {
    fn model(&self) -> &str {
        &self.model
    }

    fn column(&self) -> &str {
        &self.column
    }

    fn primary_key(&self) -> &str {
        &self.pk
    }

    fn count(&self) -> Result<u64, StorageError> {
        let count: i64 = self.conn.query_row(
            &format!("SELECT COUNT(*) FROM \"{}\"", self.table),
            [],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    fn parse_cursor(&self, cursor: &str) -> Result<PkValue, StorageError> {
        if self.pk_is_integer {
            cursor
                .trim()
                .parse()
                .map(PkValue::Integer)
                .map_err(|_| StorageError::InvalidCursor(cursor.to_string()))
        } else {
            Ok(PkValue::Text(cursor.to_string()))
        }
    }

    fn iterate_ordered_by_pk(
        &self,
        after: Option<&PkValue>,
        batch_size: usize,
    ) -> Result<Vec<RawRecord>, StorageError> {
        let limit = batch_size.max(1) as i64;
        let select = format!("SELECT \"{pk}\", \"{col}\" FROM \"{table}\"", pk = self.pk, col = self.column, table = self.table);

        let records = match after {
            Some(cursor) => {
                let mut stmt = self.conn.prepare_cached(&format!(
                    "{} WHERE \"{pk}\" > ?1 ORDER BY \"{pk}\" ASC LIMIT ?2",
                    select,
                    pk = self.pk
                ))?;
                let rows = stmt.query_map(params![cursor, limit], |row| self.read_record(row))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let mut stmt = self.conn.prepare_cached(&format!(
                    "{} ORDER BY \"{pk}\" ASC LIMIT ?1",
                    select,
                    pk = self.pk
                ))?;
                let rows = stmt.query_map(params![limit], |row| self.read_record(row))?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(records)
    }

    fn write_value(&self, pk: &PkValue, stored: &str) -> Result<(), StorageError> {
        let mut stmt = self.conn.prepare_cached(&format!(
            "UPDATE \"{}\" SET \"{}\" = ?1 WHERE \"{}\" = ?2",
            self.table, self.column, self.pk
        ))?;
        stmt.execute(params![stored, pk])?;
        Ok(())
    }

    fn begin(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("BEGIN")?;
        Ok(())
    }

    fn commit(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&self) -> Result<(), StorageError> {
        self.conn.execute_batch("ROLLBACK")?;
        Ok(())
    }
}
