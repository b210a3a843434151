use std::sync::Arc;

use tracing::trace;

use crate::primitives::bytes::buf::{ReadCursor, WriteBuffer};
use crate::primitives::bytes::StaticBuffer;
use crate::primitives::codec::AttributeValue;
use crate::storage::kcv::{Entry, KeySliceQuery, SliceQuery};
use crate::types::{ElementId, IndexId, KcvError, Result};

use super::query::{substitute_keys, IndexProvider, IndexQuery, RawQuery, RawResult};
use super::{IndexDescriptor, IndexOptions, IndexType, SchemaInspector};

const UNIQUE_COLUMN: &[u8] = &[0x00];

/// Reads the index id embedded at the front of a composite index row key.
pub fn get_index_id_from_key(key: &StaticBuffer) -> Result<IndexId> {
    key.u64_at(0).map(IndexId)
}

/// One composite index cell: row key plus entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    /// Row key derived from index id and values.
    pub key: StaticBuffer,
    /// Column and value identifying the element.
    pub entry: Entry,
}

/// Translates between logical index records and their stored form.
///
/// Composite row key layout, kept byte-stable across versions:
///
/// ```text
/// index_id:u64 BE | value_1 | ... | value_n
/// ```
///
/// Each value uses the order-preserving codec of its field's declared type,
/// so the key decodes field by field. For non-unique indexes the column is the
/// element id (`u64` BE) and the value is empty; unique indexes keep a single
/// column `0x00` whose value is the element id.
pub struct IndexSerializer {
    schema: Arc<dyn SchemaInspector>,
    provider: Option<Arc<dyn IndexProvider>>,
    options: IndexOptions,
}

impl IndexSerializer {
    /// Serializer without an external index backend.
    pub fn new(schema: Arc<dyn SchemaInspector>, options: IndexOptions) -> Self {
        Self {
            schema,
            provider: None,
            options,
        }
    }

    /// Attaches the external index backend serving mixed indexes.
    pub fn with_provider(mut self, provider: Arc<dyn IndexProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Schema this serializer resolves indexes through.
    pub fn schema(&self) -> &Arc<dyn SchemaInspector> {
        &self.schema
    }

    /// Options in effect.
    pub fn options(&self) -> &IndexOptions {
        &self.options
    }

    /// See [`get_index_id_from_key`].
    pub fn get_index_id_from_key(&self, key: &StaticBuffer) -> Result<IndexId> {
        get_index_id_from_key(key)
    }

    fn check_composite(&self, index: &IndexDescriptor, values: &[AttributeValue]) -> Result<()> {
        if !index.is_composite() {
            return Err(KcvError::invalid(format!(
                "index `{}` is {}, not composite",
                index.name,
                index.index_type.label()
            )));
        }
        if values.len() != index.fields.len() {
            return Err(KcvError::invalid(format!(
                "index `{}` has {} fields, got {} values",
                index.name,
                index.fields.len(),
                values.len()
            )));
        }
        Ok(())
    }

    /// Row key of `values` in composite `index`.
    pub fn composite_key(
        &self,
        index: &IndexDescriptor,
        values: &[AttributeValue],
    ) -> Result<StaticBuffer> {
        self.check_composite(index, values)?;
        let mut out = WriteBuffer::with_capacity(8 + 16 * values.len());
        out.put_u64(index.id.0);
        for (field, value) in index.fields.iter().zip(values) {
            field.info.data_type().write_value(value, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Decodes the values of a composite row key written for `index`.
    pub fn decode_values(
        &self,
        index: &IndexDescriptor,
        key: &StaticBuffer,
    ) -> Result<Vec<AttributeValue>> {
        let mut cur = ReadCursor::new(key.as_slice());
        let id = IndexId(cur.get_u64()?);
        if id != index.id {
            return Err(KcvError::corruption(format!(
                "row key {key:?} belongs to index {id}, not {}",
                index.id
            )));
        }
        let values = index
            .fields
            .iter()
            .map(|field| field.info.data_type().read_value(&mut cur))
            .collect::<Result<Vec<_>>>()?;
        if !cur.is_exhausted() {
            return Err(KcvError::corruption(format!(
                "{} trailing bytes in index key {key:?}",
                cur.remaining()
            )));
        }
        Ok(values)
    }

    /// Cell recording that `element` holds `values` in `index`.
    pub fn index_entry(
        &self,
        index: &IndexDescriptor,
        values: &[AttributeValue],
        element: ElementId,
    ) -> Result<IndexEntry> {
        let key = self.composite_key(index, values)?;
        let id = StaticBuffer::from_u64(element.0);
        let entry = if index.unique {
            Entry::new(StaticBuffer::from_static(UNIQUE_COLUMN), id)
        } else {
            Entry::column_only(id)
        };
        trace!(index = %index.name, key = %key, element = element.0, "index.entry");
        Ok(IndexEntry { key, entry })
    }

    /// Element referenced by a cell of `index`.
    pub fn element_from_entry(&self, index: &IndexDescriptor, entry: &Entry) -> Result<ElementId> {
        let source = if index.unique {
            &entry.value
        } else {
            &entry.column
        };
        source.as_u64().map(ElementId)
    }

    /// Point lookup of every element holding `values` in `index`.
    pub fn lookup_query(
        &self,
        index: &IndexDescriptor,
        values: &[AttributeValue],
    ) -> Result<KeySliceQuery> {
        let key = self.composite_key(index, values)?;
        Ok(KeySliceQuery::new(key, SliceQuery::full_row()))
    }

    /// Runs a mixed-index query against the external backend, returning
    /// `(element, score)` hits that may include deleted elements.
    pub fn execute_query(&self, query: &IndexQuery) -> Result<Vec<RawResult>> {
        let index = self.schema.index(&query.index)?;
        let IndexType::Mixed { backing_index } = &index.index_type else {
            return Err(KcvError::invalid(format!(
                "index `{}` is {}, not mixed",
                index.name,
                index.index_type.label()
            )));
        };
        let provider = self
            .provider
            .as_ref()
            .ok_or(KcvError::UnsupportedFeature("external index provider"))?;
        let text = substitute_keys(
            &query.query,
            &query.prefix,
            |key| self.schema.storage_field(backing_index, key),
            &self.options.unknown_key_name,
        )?;
        let raw = RawQuery {
            store: backing_index.clone(),
            query: text,
            parameters: query.parameters.clone(),
            offset: query.offset,
            limit: query.limit,
        };
        trace!(store = %raw.store, query = %raw.query, "index.query.raw");
        provider.query(&raw)
    }
}
