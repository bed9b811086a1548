use crate::error::AppError;
use crate::models::SolutionMetadata;
use crate::oracles::traits::{IndexEntry, IndexHit, MetadataFilter, VectorIndex};
use arrow::array::{
    Array, FixedSizeListBuilder, Float32Array, Float32Builder, RecordBatch, RecordBatchIterator,
    StringArray, StringBuilder,
};
use arrow::datatypes::{DataType, Field, Schema};
use async_trait::async_trait;
use futures::TryStreamExt;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{connect, Connection, DistanceType, Table};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// Solution vectors in a LanceDB table, searched by cosine distance.
///
/// Category and machine type get their own columns so filters push down to the scan.
pub struct LanceIndex {
    conn: Connection,
    table_name: String,
    dimension: usize,
    // serialises table creation and delete+add updates
    write_lock: Mutex<()>,
}

impl LanceIndex {
    pub async fn open(path: &Path, table_name: &str, dimension: usize) -> Result<Self, AppError> {
        std::fs::create_dir_all(path)?;
        let path_str = path.to_str().ok_or_else(|| {
            AppError::Config(format!("Vector path is not valid UTF-8: {:?}", path))
        })?;

        let conn = connect(path_str).execute().await?;
        info!(path = %path_str, table = %table_name, "Connected to LanceDB");

        Ok(Self {
            conn,
            table_name: table_name.to_string(),
            dimension,
            write_lock: Mutex::new(()),
        })
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("document", DataType::Utf8, false),
            Field::new("metadata", DataType::Utf8, false),
            Field::new("category", DataType::Utf8, true),
            Field::new("machine_type", DataType::Utf8, true),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, true)),
                    self.dimension as i32,
                ),
                true,
            ),
        ]))
    }

    fn to_batch(&self, entry: &IndexEntry) -> Result<RecordBatch, AppError> {
        if entry.vector.len() != self.dimension {
            return Err(AppError::VectorIndex(format!(
                "Vector for {} has {} dimensions, index expects {}",
                entry.id,
                entry.vector.len(),
                self.dimension
            )));
        }

        let mut id_builder = StringBuilder::new();
        let mut document_builder = StringBuilder::new();
        let mut metadata_builder = StringBuilder::new();
        let mut category_builder = StringBuilder::new();
        let mut machine_builder = StringBuilder::new();
        let mut vector_builder = FixedSizeListBuilder::new(
            Float32Builder::with_capacity(self.dimension),
            self.dimension as i32,
        );

        id_builder.append_value(&entry.id);
        document_builder.append_value(&entry.document);
        metadata_builder.append_value(serde_json::to_string(&entry.metadata)?);
        category_builder.append_option(entry.metadata.category.as_deref());
        machine_builder.append_option(entry.metadata.machine_type.as_deref());
        vector_builder.values().append_slice(&entry.vector);
        vector_builder.append(true);

        Ok(RecordBatch::try_new(
            self.schema(),
            vec![
                Arc::new(id_builder.finish()),
                Arc::new(document_builder.finish()),
                Arc::new(metadata_builder.finish()),
                Arc::new(category_builder.finish()),
                Arc::new(machine_builder.finish()),
                Arc::new(vector_builder.finish()),
            ],
        )?)
    }

    async fn open_table(&self) -> Result<Option<Table>, AppError> {
        let names = self.conn.table_names().execute().await?;
        if !names.contains(&self.table_name) {
            return Ok(None);
        }
        Ok(Some(self.conn.open_table(&self.table_name).execute().await?))
    }

    async fn insert(&self, entry: &IndexEntry) -> Result<(), AppError> {
        let batch = self.to_batch(entry)?;
        let reader = RecordBatchIterator::new(vec![Ok(batch)], self.schema());

        match self.open_table().await? {
            Some(table) => {
                table.add(Box::new(reader)).execute().await?;
            }
            None => {
                self.conn
                    .create_table(&self.table_name, Box::new(reader))
                    .execute()
                    .await?;
                info!(table = %self.table_name, "Created vector table");
            }
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), AppError> {
        if let Some(table) = self.open_table().await? {
            table.delete(&format!("id = '{}'", quote(id))).await?;
        }
        Ok(())
    }
}

fn quote(value: &str) -> String {
    value.replace('\'', "''")
}

fn filter_predicate(filter: &MetadataFilter) -> Option<String> {
    let mut clauses = Vec::new();
    if let Some(category) = &filter.category {
        clauses.push(format!("category = '{}'", quote(category)));
    }
    if let Some(machine_type) = &filter.machine_type {
        clauses.push(format!("machine_type = '{}'", quote(machine_type)));
    }
    (!clauses.is_empty()).then(|| clauses.join(" AND "))
}

fn string_column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a StringArray, AppError> {
    batch
        .column_by_name(name)
        .ok_or_else(|| AppError::VectorIndex(format!("Column '{}' not found", name)))?
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| AppError::VectorIndex(format!("Column '{}' is not a string column", name)))
}

#[async_trait]
impl VectorIndex for LanceIndex {
    #[instrument(skip_all, fields(id = %entry.id))]
    async fn add(&self, entry: IndexEntry) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        self.insert(&entry).await
    }

    #[instrument(skip_all, fields(id = %entry.id))]
    async fn update(&self, entry: IndexEntry) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        self.remove(&entry.id).await?;
        self.insert(&entry).await
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        self.remove(id).await
    }

    async fn query(
        &self,
        vector: &[f32],
        k: usize,
        filter: Option<&MetadataFilter>,
    ) -> Result<Vec<IndexHit>, AppError> {
        let Some(table) = self.open_table().await? else {
            return Ok(Vec::new());
        };
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query = table.query();
        if let Some(predicate) = filter.and_then(filter_predicate) {
            debug!(predicate = %predicate, "Filtering vector query");
            query = query.only_if(predicate);
        }

        let mut results = query
            .limit(k)
            .nearest_to(vector.to_vec())?
            .distance_type(DistanceType::Cosine)
            .execute()
            .await?;

        let mut hits = Vec::new();
        while let Some(batch) = results.try_next().await? {
            let ids = string_column(&batch, "id")?;
            let documents = string_column(&batch, "document")?;
            let metadata = string_column(&batch, "metadata")?;
            let distances = batch
                .column_by_name("_distance")
                .ok_or_else(|| AppError::VectorIndex("Column '_distance' not found".to_string()))?
                .as_any()
                .downcast_ref::<Float32Array>()
                .ok_or_else(|| {
                    AppError::VectorIndex("Column '_distance' is not a float column".to_string())
                })?;

            for i in 0..batch.num_rows() {
                if ids.is_null(i) {
                    continue;
                }
                let metadata: SolutionMetadata = if metadata.is_null(i) {
                    SolutionMetadata::default()
                } else {
                    serde_json::from_str(metadata.value(i))?
                };
                hits.push(IndexHit {
                    id: ids.value(i).to_string(),
                    distance: if distances.is_null(i) { 1.0 } else { distances.value(i) },
                    document: documents.value(i).to_string(),
                    metadata,
                });
            }
        }

        Ok(hits)
    }

    async fn count(&self) -> Result<usize, AppError> {
        match self.open_table().await? {
            Some(table) => Ok(table.count_rows(None).await?),
            None => Ok(0),
        }
    }
}
