//! Backing-store driver traits.
//!
//! The drivers decouple the DAOs from a specific database. A SQL
//! implementation maps each method onto one parameterized statement; the
//! `_multi` forms are meant to be one UNION-style query, not N round trips.
//!
//! Every value handed to a driver has already been bound to its field type
//! by the DAO, and blob fields are in their encoded form.
//!
//! Drivers pick their connection from the definition they are handed: reads
//! use `entity.source_pool_read`, writes `entity.source_pool_write`.
//!
//! # Error Handling
//!
//! Return `Error::Store` for anything the store itself reported
//! (connectivity, constraint violations, malformed queries) and
//! `Error::NotImplemented` / `Error::ConfigError` for requests the driver
//! cannot express at all. The link DAO turns the former into `Ok(false)` and
//! propagates the latter.

use crate::entity::EntityDefinition;
use crate::error::Result;
use crate::value::{FieldVals, OrderBy, Row, Value};

pub mod memory;

pub use memory::MemoryStore;

/// Driver for entities with a single primary key.
#[allow(async_fn_in_trait)]
pub trait RecordDriver: Send + Sync {
    /// Fetch one row by primary key.
    ///
    /// # Returns
    /// - `Ok(Some(row))` - Row found
    /// - `Ok(None)` - No such row (not an error)
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn record(&self, entity: &EntityDefinition, pk: &Value) -> Result<Option<Row>>;

    /// Fetch the rows of several primary keys, in any order. Missing rows
    /// are simply absent.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn records(&self, entity: &EntityDefinition, pks: &[Value]) -> Result<Vec<Row>>;

    /// Count rows matching `fieldvals`; an empty predicate counts every row.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn count(&self, entity: &EntityDefinition, fieldvals: &FieldVals) -> Result<u64>;

    /// One count per predicate, in order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn count_multi(
        &self,
        entity: &EntityDefinition,
        fieldvals_arr: &[FieldVals],
    ) -> Result<Vec<u64>>;

    /// Primary keys of rows matching `fieldvals`, in primary-key order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn by_fields(&self, entity: &EntityDefinition, fieldvals: &FieldVals)
        -> Result<Vec<Value>>;

    /// One primary-key list per predicate, in order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn by_fields_multi(
        &self,
        entity: &EntityDefinition,
        fieldvals_arr: &[FieldVals],
    ) -> Result<Vec<Vec<Value>>>;

    /// A page of primary keys of rows matching `fieldvals`, ordered by
    /// `order_by` then by primary key.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn by_fields_offset(
        &self,
        entity: &EntityDefinition,
        fieldvals: &FieldVals,
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>>;

    /// One page per predicate, in order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn by_fields_offset_multi(
        &self,
        entity: &EntityDefinition,
        fieldvals_arr: &[FieldVals],
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Vec<Value>>>;

    /// Every row, in primary-key order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn all(&self, entity: &EntityDefinition) -> Result<Vec<Row>>;

    /// Insert one row and return it as stored, generated primary key
    /// included.
    ///
    /// # Errors
    /// Returns `Err` if the store rejects the row
    async fn insert(&self, entity: &EntityDefinition, row: Row) -> Result<Row>;

    /// Insert several rows atomically and return them as stored, in order.
    ///
    /// `homogeneous` is set when every row has the same field set, which
    /// allows a single multi-row statement.
    ///
    /// # Errors
    /// Returns `Err` if the store rejects any row; then none is inserted
    async fn insert_multi(
        &self,
        entity: &EntityDefinition,
        rows: Vec<Row>,
        homogeneous: bool,
    ) -> Result<Vec<Row>>;

    /// Write `info` to the row with primary key `pk`.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn update(&self, entity: &EntityDefinition, pk: &Value, info: &FieldVals) -> Result<()>;

    /// Delete one row.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn delete(&self, entity: &EntityDefinition, pk: &Value) -> Result<()>;

    /// Delete several rows.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn delete_multi(&self, entity: &EntityDefinition, pks: &[Value]) -> Result<()>;
}

/// Driver for two-column linking entities.
#[allow(async_fn_in_trait)]
pub trait LinkDriver: Send + Sync {
    /// Values of `select_field` of the rows matching `fieldvals`, ascending.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn by_fields(
        &self,
        entity: &EntityDefinition,
        select_field: &str,
        fieldvals: &FieldVals,
    ) -> Result<Vec<Value>>;

    /// One value list per predicate, in order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn by_fields_multi(
        &self,
        entity: &EntityDefinition,
        select_field: &str,
        fieldvals_arr: &[FieldVals],
    ) -> Result<Vec<Vec<Value>>>;

    /// A page of `select_field` values, ordered by fields of `foreign`, the
    /// entity `select_field` references (a join on its primary key).
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    #[allow(clippy::too_many_arguments)]
    async fn by_fields_limit(
        &self,
        entity: &EntityDefinition,
        foreign: &EntityDefinition,
        select_field: &str,
        fieldvals: &FieldVals,
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Value>>;

    /// One page per predicate, in order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    #[allow(clippy::too_many_arguments)]
    async fn by_fields_limit_multi(
        &self,
        entity: &EntityDefinition,
        foreign: &EntityDefinition,
        select_field: &str,
        fieldvals_arr: &[FieldVals],
        order_by: &OrderBy,
        offset: Option<u64>,
        limit: Option<u64>,
    ) -> Result<Vec<Vec<Value>>>;

    /// Count links matching `fieldvals`.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn count(&self, entity: &EntityDefinition, fieldvals: &FieldVals) -> Result<u64>;

    /// One count per predicate, in order.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn count_multi(
        &self,
        entity: &EntityDefinition,
        fieldvals_arr: &[FieldVals],
    ) -> Result<Vec<u64>>;

    /// Insert one link. With `replace`, an existing identical link is
    /// overwritten instead of rejected.
    ///
    /// # Errors
    /// `Error::NotImplemented` if `replace` is unsupported, `Error::Store`
    /// if the store rejects the row
    async fn insert(&self, entity: &EntityDefinition, row: Row, replace: bool) -> Result<()>;

    /// Insert several links atomically.
    ///
    /// # Errors
    /// See [`LinkDriver::insert`]
    async fn insert_multi(&self, entity: &EntityDefinition, rows: Vec<Row>, replace: bool)
        -> Result<()>;

    /// Write `new_info` to every link matching `where_`.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn update(
        &self,
        entity: &EntityDefinition,
        new_info: &FieldVals,
        where_: &FieldVals,
    ) -> Result<()>;

    /// Delete every link matching `keys`.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn delete(&self, entity: &EntityDefinition, keys: &FieldVals) -> Result<()>;

    /// Delete every link matching any of `keys_arr`.
    ///
    /// # Errors
    /// Returns `Err` if the store fails
    async fn delete_multi(&self, entity: &EntityDefinition, keys_arr: &[FieldVals]) -> Result<()>;
}
