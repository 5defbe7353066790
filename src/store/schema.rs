//! Declarative entity schemas and SQL statement generation.
//!
//! Entity types describe their persisted attributes with a static
//! [`EntitySchema`]. [`SchemaMapper`] derives a [`TableSpec`] from it once per
//! type and turns records into sea-query statements. No other module builds
//! query text.

use std::{any::TypeId, sync::Arc};

use chrono::{DateTime, Utc};
use sea_query::{Alias, ColumnDef, Expr, Func, Iden, Index, Order as SeaOrder, Query as SeaQuery, SelectStatement, SimpleExpr, SqliteQueryBuilder, Table, Value};
use sea_query_binder::{SqlxBinder, SqlxValues};
use serde::{Deserialize, Serialize};
use sqlx::{Row, sqlite::SqliteRow};

use crate::{FleetError, Result, common::MemCache, utils::time};

/// A generated statement: SQL text plus its bound values.
pub type Statement = (String, SqlxValues);

const DEFAULT_VARCHAR_LEN: u32 = 32;
const DEFAULT_ENUM_LEN: u32 = 64;

#[derive(Iden)]
enum BaseIden {
    Id,
    Revision,
    CreateTime,
    ModifyTime,
}

#[derive(Iden)]
#[iden = "sqlite_master"]
enum SqliteMasterIden {
    Table,
    Type,
    Name,
}

/// Rust-side kind of a persisted attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    Text,
    Integer,
    BigInt,
    /// Stored by symbolic name, never by ordinal.
    Enum,
    Timestamp,
    Bool,
}

/// Column type in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageType {
    Varchar,
    Integer,
    BigInt,
    SmallInt,
    Timestamp,
    Boolean,
    Text,
}

impl FieldKind {
    fn default_storage(self) -> StorageType {
        match self {
            FieldKind::Text | FieldKind::Enum => StorageType::Varchar,
            FieldKind::Integer => StorageType::Integer,
            FieldKind::BigInt => StorageType::BigInt,
            FieldKind::Timestamp => StorageType::Timestamp,
            FieldKind::Bool => StorageType::Boolean,
        }
    }

    fn null_value(self) -> Value {
        match self {
            FieldKind::Text | FieldKind::Enum => Value::String(None),
            FieldKind::Integer | FieldKind::BigInt => Value::BigInt(None),
            FieldKind::Timestamp => Value::ChronoDateTimeUtc(None),
            FieldKind::Bool => Value::Bool(None),
        }
    }
}

/// Declarative tag on one entity attribute.
///
/// Built in `const` context so an entity's whole schema is a `static`:
///
/// ```rust,ignore
/// ColumnAttr::new("org_id", FieldKind::Text).column("org_msp_id").length(128).key()
/// ```
#[derive(Debug, Clone, Copy)]
pub struct ColumnAttr {
    pub field: &'static str,
    pub kind: FieldKind,
    pub column: Option<&'static str>,
    pub length: Option<u32>,
    pub storage: Option<StorageType>,
    pub key: bool,
    pub not_null: bool,
    pub unique: bool,
}

impl ColumnAttr {
    pub const fn new(
        field: &'static str,
        kind: FieldKind,
    ) -> Self {
        Self {
            field,
            kind,
            column: None,
            length: None,
            storage: None,
            key: false,
            not_null: false,
            unique: false,
        }
    }

    /// Overrides the column name, which defaults to the field name.
    pub const fn column(
        mut self,
        name: &'static str,
    ) -> Self {
        self.column = Some(name);
        self
    }

    pub const fn length(
        mut self,
        length: u32,
    ) -> Self {
        self.length = Some(length);
        self
    }

    pub const fn storage(
        mut self,
        storage: StorageType,
    ) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Marks the attribute as part of the natural key.
    pub const fn key(mut self) -> Self {
        self.key = true;
        self
    }

    pub const fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub const fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

/// Compile-time schema description of an entity type.
#[derive(Debug)]
pub struct EntitySchema {
    pub table: &'static str,
    pub type_name: &'static str,
    pub columns: &'static [ColumnAttr],
}

/// One persisted attribute of a derived table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub column_name: String,
    pub storage_type: StorageType,
    pub source_field_name: String,
    pub max_length: Option<u32>,
    pub nullable: bool,
    pub unique: bool,
    pub is_key_field: bool,
    pub kind: FieldKind,
    /// `id`, `revision`, `create_time` and `modify_time`, shared by every table.
    pub is_base: bool,
}

/// Table metadata of one entity type, immutable once derived.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    pub table_name: String,
    pub record_type_name: String,
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn key_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.is_key_field)
    }

    pub fn entity_columns(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| !c.is_base)
    }

    /// Finds a column by field or column name, ignoring case.
    pub fn column(
        &self,
        name: &str,
    ) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.source_field_name.eq_ignore_ascii_case(name) || c.column_name.eq_ignore_ascii_case(name))
    }

    fn table_iden(&self) -> Alias {
        Alias::new(self.table_name.as_str())
    }
}

/// Surrogate key and bookkeeping embedded in every entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub id: Option<i64>,
    pub revision: Option<i64>,
    pub created_at: Option<DateTime<Utc>>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// A set attribute value, as read from or written to an entity.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Int(i64),
    Enum(String),
    Timestamp(DateTime<Utc>),
    Bool(bool),
}

impl FieldValue {
    fn matches(
        &self,
        kind: FieldKind,
    ) -> bool {
        matches!(
            (self, kind),
            (FieldValue::Text(_), FieldKind::Text)
                | (FieldValue::Enum(_), FieldKind::Enum)
                | (FieldValue::Int(_), FieldKind::Integer | FieldKind::BigInt)
                | (FieldValue::Timestamp(_), FieldKind::Timestamp)
                | (FieldValue::Bool(_), FieldKind::Bool)
        )
    }

    pub fn into_text(self) -> Result<String> {
        match self {
            FieldValue::Text(s) | FieldValue::Enum(s) => Ok(s),
            other => Err(FleetError::Convert(format!("expected text, got {:?}", other))),
        }
    }

    pub fn into_int(self) -> Result<i64> {
        match self {
            FieldValue::Int(v) => Ok(v),
            other => Err(FleetError::Convert(format!("expected integer, got {:?}", other))),
        }
    }

    /// Parses a symbolic enum name.
    pub fn into_enum<E>(self) -> Result<E>
    where
        E: std::str::FromStr<Err = strum::ParseError>,
    {
        Ok(self.into_text()?.parse::<E>()?)
    }
}

impl From<FieldValue> for Value {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Text(s) | FieldValue::Enum(s) => s.into(),
            FieldValue::Int(v) => v.into(),
            FieldValue::Timestamp(t) => t.into(),
            FieldValue::Bool(b) => b.into(),
        }
    }
}

/// A record type persisted through the checkpoint store.
///
/// Unset attributes (`None`) are wildcards in queries and NULL on insert.
pub trait Entity: Default + Clone + Send + Sync + 'static {
    fn schema() -> &'static EntitySchema;

    fn base(&self) -> &PersistedRecord;

    fn base_mut(&mut self) -> &mut PersistedRecord;

    /// Returns the value of a tagged attribute, `None` when unset.
    fn field(
        &self,
        name: &str,
    ) -> Option<FieldValue>;

    fn set_field(
        &mut self,
        name: &str,
        value: FieldValue,
    ) -> Result<()>;
}

/// Sort order of a query, applied in insertion order.
#[derive(Debug, Clone, Default)]
pub struct OrderBy {
    fields: Vec<(String, bool)>,
}

impl OrderBy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(
        mut self,
        field: &str,
    ) -> Self {
        self.fields.push((field.to_string(), true));
        self
    }

    pub fn desc(
        mut self,
        field: &str,
    ) -> Self {
        self.fields.push((field.to_string(), false));
        self
    }
}

/// 1-based pagination. A non-positive index or size selects every match.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Page {
    pub index: i64,
    pub size: i64,
}

impl Page {
    pub fn new(
        index: i64,
        size: i64,
    ) -> Self {
        Self {
            index,
            size,
        }
    }

    pub fn all() -> Self {
        Self::default()
    }

    pub fn is_paged(&self) -> bool {
        self.index > 0 && self.size > 0
    }

    /// Saturates, so a page far past the end is just empty.
    fn offset(&self) -> u64 {
        (self.index - 1).saturating_mul(self.size) as u64
    }
}

/// Derives table metadata from entity schemas and builds every statement.
pub struct SchemaMapper {
    tables: MemCache<TypeId, Arc<TableSpec>>,
}

impl Default for SchemaMapper {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaMapper {
    pub fn new() -> Self {
        Self {
            tables: MemCache::new(64),
        }
    }

    /// Returns the table of `T`, deriving it on first use.
    ///
    /// Fails when the schema declares no attributes or repeats a column.
    pub fn derive_table<T: Entity>(&self) -> Result<Arc<TableSpec>> {
        self.tables.get_or_try_insert(TypeId::of::<T>(), || build_table_spec(T::schema()).map(Arc::new))
    }

    pub fn create_table_statement(
        &self,
        table: &TableSpec,
    ) -> String {
        let mut stmt = Table::create();
        stmt.table(table.table_iden()).if_not_exists();
        for column in table.columns.iter() {
            stmt.col(&mut column_def(column));
        }
        stmt.build(SqliteQueryBuilder)
    }

    /// Non-unique index over the natural key. Duplicate keys are repaired by
    /// the store, so the index must tolerate them.
    pub fn create_index_statement(
        &self,
        table: &TableSpec,
    ) -> Option<String> {
        let mut keys = table.key_columns().peekable();
        keys.peek()?;

        let mut stmt = Index::create();
        stmt.name(format!("idx_{}_natural_key", table.table_name)).if_not_exists().table(table.table_iden());
        for column in keys {
            stmt.col(Alias::new(column.column_name.as_str()));
        }
        Some(stmt.build(SqliteQueryBuilder))
    }

    pub fn table_exists_statement(
        &self,
        table: &TableSpec,
    ) -> Statement {
        SeaQuery::select()
            .expr(Func::count(Expr::col(SqliteMasterIden::Name)))
            .from(SqliteMasterIden::Table)
            .and_where(Expr::col(SqliteMasterIden::Type).eq("table"))
            .and_where(Expr::col(SqliteMasterIden::Name).eq(table.table_name.as_str()))
            .build_sqlx(SqliteQueryBuilder)
    }

    /// Inserts every entity column, with revision 0 and both timestamps now.
    pub fn insert_statement<T: Entity>(
        &self,
        record: &T,
    ) -> Result<Statement> {
        let table = self.derive_table::<T>()?;
        let now = time::now();

        let mut columns = Vec::new();
        let mut values: Vec<SimpleExpr> = Vec::new();
        for column in table.entity_columns() {
            columns.push(Alias::new(column.column_name.as_str()));
            values.push(column_value(column, record)?.into());
        }
        columns.extend([
            Alias::new(BaseIden::Revision.to_string()),
            Alias::new(BaseIden::CreateTime.to_string()),
            Alias::new(BaseIden::ModifyTime.to_string()),
        ]);
        values.extend([Value::from(0i64).into(), Value::from(now).into(), Value::from(now).into()]);

        Ok(SeaQuery::insert().into_table(table.table_iden()).columns(columns).values(values)?.build_sqlx(SqliteQueryBuilder))
    }

    /// Writes the set entity columns of `record`, bumps the revision and
    /// refreshes `modify_time`.
    pub fn update_by_id_statement<T: Entity>(
        &self,
        record: &T,
    ) -> Result<Statement> {
        let table = self.derive_table::<T>()?;
        let id = record.base().id.ok_or_else(|| FleetError::Store(format!("{} has no id to update by", table.record_type_name)))?;

        let mut stmt = SeaQuery::update();
        stmt.table(table.table_iden());
        for column in table.entity_columns() {
            if let Some(value) = checked_field(column, record)? {
                stmt.value(Alias::new(column.column_name.as_str()), Value::from(value));
            }
        }
        stmt.value(BaseIden::Revision, Expr::col(BaseIden::Revision).add(1))
            .value(BaseIden::ModifyTime, Value::from(time::now()))
            .and_where(Expr::col(BaseIden::Id).eq(id));

        Ok(stmt.build_sqlx(SqliteQueryBuilder))
    }

    /// Deletes rows matching the set key fields of `record`.
    ///
    /// At least one key field must be set, otherwise every row would match.
    pub fn delete_by_natural_key_statement<T: Entity>(
        &self,
        record: &T,
    ) -> Result<Statement> {
        let table = self.derive_table::<T>()?;
        let mut conditions = Vec::new();
        for column in table.key_columns() {
            if let Some(value) = checked_field(column, record)? {
                conditions.push(Expr::col(Alias::new(column.column_name.as_str())).eq(Value::from(value)));
            }
        }
        if conditions.is_empty() {
            return Err(FleetError::Store(format!("refusing to delete from {} without a key field", table.table_name)));
        }

        let mut stmt = SeaQuery::delete();
        stmt.from_table(table.table_iden());
        for cond in conditions {
            stmt.and_where(cond);
        }
        Ok(stmt.build_sqlx(SqliteQueryBuilder))
    }

    /// Selects rows whose columns equal every set field of `query`.
    pub fn select_statement<T: Entity>(
        &self,
        query: &T,
        order_by: &OrderBy,
        page: Page,
    ) -> Result<Statement> {
        let table = self.derive_table::<T>()?;
        let mut stmt = SeaQuery::select();
        stmt.columns(table.columns.iter().map(|c| Alias::new(c.column_name.as_str()))).from(table.table_iden());
        self.apply_query(&table, query, order_by, page, &mut stmt)?;
        Ok(stmt.build_sqlx(SqliteQueryBuilder))
    }

    /// Same filter as [`Self::select_statement`], returning only ids.
    pub fn select_ids_statement<T: Entity>(
        &self,
        query: &T,
        order_by: &OrderBy,
        page: Page,
    ) -> Result<Statement> {
        let table = self.derive_table::<T>()?;
        let mut stmt = SeaQuery::select();
        stmt.column(BaseIden::Id).from(table.table_iden());
        self.apply_query(&table, query, order_by, page, &mut stmt)?;
        Ok(stmt.build_sqlx(SqliteQueryBuilder))
    }

    pub fn count_statement<T: Entity>(
        &self,
        query: &T,
    ) -> Result<Statement> {
        let table = self.derive_table::<T>()?;
        let mut stmt = SeaQuery::select();
        stmt.expr(Func::count(Expr::col(BaseIden::Id))).from(table.table_iden());
        for cond in filter_conditions(&table, query)? {
            stmt.and_where(cond);
        }
        Ok(stmt.build_sqlx(SqliteQueryBuilder))
    }

    /// Selects rows matching every key field of `record`, which must all be set.
    pub fn select_by_natural_key_statement<T: Entity>(
        &self,
        record: &T,
    ) -> Result<Statement> {
        let table = self.derive_table::<T>()?;
        let mut stmt = SeaQuery::select();
        stmt.columns(table.columns.iter().map(|c| Alias::new(c.column_name.as_str()))).from(table.table_iden());
        for column in table.key_columns() {
            let value = checked_field(column, record)?
                .ok_or_else(|| FleetError::Store(format!("key field {}.{} is not set", table.record_type_name, column.source_field_name)))?;
            stmt.and_where(Expr::col(Alias::new(column.column_name.as_str())).eq(Value::from(value)));
        }
        stmt.order_by(BaseIden::Id, SeaOrder::Asc);
        Ok(stmt.build_sqlx(SqliteQueryBuilder))
    }

    /// Decodes one row selected by [`Self::select_statement`].
    pub fn read_row<T: Entity>(
        &self,
        table: &TableSpec,
        row: &SqliteRow,
    ) -> Result<T> {
        let mut record = T::default();
        for column in table.columns.iter() {
            let name = column.column_name.as_str();
            let value = match column.kind {
                FieldKind::Text => row.try_get::<Option<String>, _>(name)?.map(FieldValue::Text),
                FieldKind::Enum => row.try_get::<Option<String>, _>(name)?.map(FieldValue::Enum),
                FieldKind::Integer | FieldKind::BigInt => row.try_get::<Option<i64>, _>(name)?.map(FieldValue::Int),
                FieldKind::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(name)?.map(FieldValue::Timestamp),
                FieldKind::Bool => row.try_get::<Option<bool>, _>(name)?.map(FieldValue::Bool),
            };
            let Some(value) = value else {
                continue;
            };

            if column.is_base {
                let base = record.base_mut();
                match (column.source_field_name.as_str(), value) {
                    ("id", FieldValue::Int(v)) => base.id = Some(v),
                    ("revision", FieldValue::Int(v)) => base.revision = Some(v),
                    ("created_at", FieldValue::Timestamp(t)) => base.created_at = Some(t),
                    ("modified_at", FieldValue::Timestamp(t)) => base.modified_at = Some(t),
                    (field, value) => return Err(FleetError::Store(format!("unexpected base value {:?} for {}", value, field))),
                }
            } else {
                record.set_field(&column.source_field_name, value)?;
            }
        }
        Ok(record)
    }

    fn apply_query<T: Entity>(
        &self,
        table: &TableSpec,
        query: &T,
        order_by: &OrderBy,
        page: Page,
        stmt: &mut SelectStatement,
    ) -> Result<()> {
        for cond in filter_conditions(table, query)? {
            stmt.and_where(cond);
        }
        for (field, asc) in order_by.fields.iter() {
            let column = table.column(field).ok_or_else(|| FleetError::Store(format!("unknown order field '{}' on {}", field, table.table_name)))?;
            stmt.order_by(
                Alias::new(column.column_name.as_str()),
                if *asc {
                    SeaOrder::Asc
                } else {
                    SeaOrder::Desc
                },
            );
        }
        if page.is_paged() {
            stmt.limit(page.size as u64).offset(page.offset());
        }
        Ok(())
    }
}

fn build_table_spec(schema: &EntitySchema) -> Result<TableSpec> {
    if schema.columns.is_empty() {
        return Err(FleetError::Schema(format!("{} declares no persisted attributes", schema.type_name)));
    }
    if schema.table.is_empty() {
        return Err(FleetError::Schema(format!("{} declares no table name", schema.type_name)));
    }

    let mut columns = vec![base_column(BaseIden::Id, "id", FieldKind::BigInt, StorageType::Integer)];
    for attr in schema.columns.iter() {
        let column_name = attr.column.unwrap_or(attr.field).to_string();
        if columns.iter().any(|c: &ColumnSpec| c.column_name.eq_ignore_ascii_case(&column_name)) || is_base_column(&column_name) {
            return Err(FleetError::Schema(format!("{} declares column '{}' twice", schema.type_name, column_name)));
        }
        let storage_type = attr.storage.unwrap_or(attr.kind.default_storage());
        let max_length = match storage_type {
            StorageType::Varchar => Some(attr.length.unwrap_or(if attr.kind == FieldKind::Enum {
                DEFAULT_ENUM_LEN
            } else {
                DEFAULT_VARCHAR_LEN
            })),
            _ => None,
        };
        columns.push(ColumnSpec {
            column_name,
            storage_type,
            source_field_name: attr.field.to_string(),
            max_length,
            nullable: !attr.not_null,
            unique: attr.unique,
            is_key_field: attr.key,
            kind: attr.kind,
            is_base: false,
        });
    }
    columns.extend([
        base_column(BaseIden::Revision, "revision", FieldKind::BigInt, StorageType::Integer),
        base_column(BaseIden::CreateTime, "created_at", FieldKind::Timestamp, StorageType::Timestamp),
        base_column(BaseIden::ModifyTime, "modified_at", FieldKind::Timestamp, StorageType::Timestamp),
    ]);

    Ok(TableSpec {
        table_name: schema.table.to_string(),
        record_type_name: schema.type_name.to_string(),
        columns,
    })
}

fn is_base_column(name: &str) -> bool {
    [BaseIden::Id, BaseIden::Revision, BaseIden::CreateTime, BaseIden::ModifyTime].iter().any(|iden| iden.to_string().eq_ignore_ascii_case(name))
}

fn base_column(
    iden: BaseIden,
    field: &str,
    kind: FieldKind,
    storage_type: StorageType,
) -> ColumnSpec {
    ColumnSpec {
        column_name: iden.to_string(),
        storage_type,
        source_field_name: field.to_string(),
        max_length: None,
        nullable: !matches!(iden, BaseIden::Id),
        unique: false,
        is_key_field: false,
        kind,
        is_base: true,
    }
}

fn column_def(column: &ColumnSpec) -> ColumnDef {
    let mut def = ColumnDef::new(Alias::new(column.column_name.as_str()));
    if column.is_base && column.column_name == BaseIden::Id.to_string() {
        def.integer().not_null().auto_increment().primary_key();
        return def;
    }

    match column.storage_type {
        StorageType::Varchar => def.string_len(column.max_length.unwrap_or(DEFAULT_VARCHAR_LEN)),
        StorageType::Integer => def.integer(),
        StorageType::BigInt => def.big_integer(),
        StorageType::SmallInt => def.small_integer(),
        StorageType::Timestamp => def.timestamp(),
        StorageType::Boolean => def.boolean(),
        StorageType::Text => def.text(),
    };
    if column.nullable {
        def.null();
    } else {
        def.not_null();
    }
    if column.unique {
        def.unique_key();
    }
    def
}

/// Reads a field and checks it against the declared kind.
fn checked_field<T: Entity>(
    column: &ColumnSpec,
    record: &T,
) -> Result<Option<FieldValue>> {
    match record.field(&column.source_field_name) {
        Some(value) if !value.matches(column.kind) => {
            Err(FleetError::Schema(format!("field {} holds {:?}, declared as {:?}", column.source_field_name, value, column.kind)))
        }
        value => Ok(value),
    }
}

/// The bound value of a column, or a typed NULL when the field is unset.
fn column_value<T: Entity>(
    column: &ColumnSpec,
    record: &T,
) -> Result<Value> {
    Ok(checked_field(column, record)?.map(Value::from).unwrap_or_else(|| column.kind.null_value()))
}

fn filter_conditions<T: Entity>(
    table: &TableSpec,
    query: &T,
) -> Result<Vec<SimpleExpr>> {
    let mut conditions = Vec::new();
    if let Some(id) = query.base().id {
        conditions.push(Expr::col(BaseIden::Id).eq(id));
    }
    for column in table.entity_columns() {
        if let Some(value) = checked_field(column, query)? {
            conditions.push(Expr::col(Alias::new(column.column_name.as_str())).eq(Value::from(value)));
        }
    }
    Ok(conditions)
}
