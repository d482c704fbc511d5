//! Descriptores de jobs de usuario. Cada operación con código de usuario
//! lleva un `UserJob`: el comando de shell y los ficheros que se enviarían a
//! un clúster real, y el descriptor que el ejecutor local despacha.

use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::BTreeMap, fmt, sync::Arc};

use crate::error::{Result, TmError};
use crate::format::{Format, Row};

pub const DEFAULT_MEMORY_LIMIT: u64 = 1000 * 1024 * 1024;

/// Datos del job visibles para el código de usuario.
#[derive(Debug, Clone, Default)]
pub struct JobContext {
    pub job_index: usize,
    pub job_count: usize,
    pub table_index: usize,
    pub files: BTreeMap<String, JobFile>,
    pub environment: BTreeMap<String, String>,
}

impl JobContext {
    pub fn file(&self, name: &str) -> Result<&JobFile> {
        self.files
            .get(name)
            .ok_or_else(|| TmError::generic(format!("job file {name:?} is not attached")))
    }

    pub fn file_text(&self, name: &str) -> Result<String> {
        let file = self.file(name)?;
        String::from_utf8(file.content.to_vec())
            .map(|s| s.trim().to_string())
            .map_err(|e| TmError::format(format!("job file {name:?} is not utf-8: {e}")))
    }
}

#[async_trait]
pub trait Mapper: Send + Sync {
    async fn map(&self, row: Row, ctx: &JobContext) -> Result<Vec<Row>>;
}

/// Mapper que recibe toda la entrada del job de una vez.
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(&self, rows: Vec<Row>, ctx: &JobContext) -> Result<Vec<Row>>;
}

#[async_trait]
pub trait Reducer: Send + Sync {
    async fn reduce(&self, key: Row, rows: Vec<Row>) -> Result<Vec<Row>>;
}

/// Reducer que trabaja sobre el flujo crudo en el formato del job.
#[async_trait]
pub trait RawReducer: Send + Sync {
    async fn reduce_raw(&self, input: Bytes, ctx: &JobContext) -> Result<Bytes>;
}

#[async_trait]
pub trait ContextualReducer: Send + Sync {
    async fn reduce(&self, key: Row, rows: Vec<Row>, ctx: &JobContext) -> Result<Vec<Row>>;
}

#[derive(Clone)]
pub enum JobDescriptor {
    Mapper(Arc<dyn Mapper>),
    Aggregator(Arc<dyn Aggregator>),
    Reducer(Arc<dyn Reducer>),
    RawReducer(Arc<dyn RawReducer>),
    ContextualReducer(Arc<dyn ContextualReducer>),
}

impl JobDescriptor {
    pub fn kind(&self) -> &'static str {
        match self {
            JobDescriptor::Mapper(_) => "mapper",
            JobDescriptor::Aggregator(_) => "aggregator",
            JobDescriptor::Reducer(_) => "reducer",
            JobDescriptor::RawReducer(_) => "raw_reducer",
            JobDescriptor::ContextualReducer(_) => "contextual_reducer",
        }
    }
}

impl fmt::Debug for JobDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JobDescriptor::{}", self.kind())
    }
}

/// Fichero adjunto al job. Los secretos no se muestran en `Debug`.
#[derive(Clone, PartialEq)]
pub struct JobFile {
    pub name: String,
    pub content: Bytes,
    pub secret: bool,
}

impl JobFile {
    pub fn new(name: &str, content: impl Into<Bytes>) -> Self {
        Self {
            name: name.to_string(),
            content: content.into(),
            secret: false,
        }
    }

    pub fn secret(name: &str, content: impl Into<Bytes>) -> Self {
        Self {
            secret: true,
            ..Self::new(name, content)
        }
    }
}

impl fmt::Debug for JobFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let content: &dyn fmt::Debug = if self.secret {
            &"<secret>"
        } else {
            &self.content
        };
        f.debug_struct("JobFile")
            .field("name", &self.name)
            .field("content", content)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct UserJob {
    pub descriptor: JobDescriptor,
    pub command: String,
    pub files: Vec<JobFile>,
    pub input_format: Format,
    pub output_format: Format,
    pub memory_limit: u64,
    pub environment: BTreeMap<String, String>,
}

impl UserJob {
    pub fn new(descriptor: JobDescriptor, command: impl Into<String>) -> Self {
        Self {
            descriptor,
            command: command.into(),
            files: Vec::new(),
            input_format: Format::Json,
            output_format: Format::Json,
            memory_limit: DEFAULT_MEMORY_LIMIT,
            environment: BTreeMap::new(),
        }
    }

    pub fn mapper(mapper: impl Mapper + 'static, command: impl Into<String>) -> Self {
        Self::new(JobDescriptor::Mapper(Arc::new(mapper)), command)
    }

    pub fn with_file(mut self, file: JobFile) -> Self {
        self.files.push(file);
        self
    }

    pub fn with_formats(mut self, input: Format, output: Format) -> Self {
        self.input_format = input;
        self.output_format = output;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn context(&self, job_index: usize, job_count: usize) -> JobContext {
        JobContext {
            job_index,
            job_count,
            table_index: 0,
            files: self
                .files
                .iter()
                .map(|f| (f.name.clone(), f.clone()))
                .collect(),
            environment: self.environment.clone(),
        }
    }
}

/// Ejecuta un job sobre su porción de entrada y devuelve las filas de salida.
/// La entrada de los reducers debe venir agrupada por `reduce_by`.
pub async fn run_job(
    job: &UserJob,
    rows: Vec<Row>,
    reduce_by: &[String],
    ctx: &JobContext,
) -> Result<Vec<Row>> {
    match &job.descriptor {
        JobDescriptor::Mapper(mapper) => {
            let mut out = Vec::new();
            for row in rows {
                out.extend(mapper.map(row, ctx).await?);
            }
            Ok(out)
        }
        JobDescriptor::Aggregator(aggregator) => aggregator.aggregate(rows, ctx).await,
        JobDescriptor::Reducer(reducer) => {
            let mut out = Vec::new();
            for (key, group) in group_by_key(rows, reduce_by) {
                out.extend(reducer.reduce(key, group).await?);
            }
            Ok(out)
        }
        JobDescriptor::ContextualReducer(reducer) => {
            let mut out = Vec::new();
            for (key, group) in group_by_key(rows, reduce_by) {
                out.extend(reducer.reduce(key, group, ctx).await?);
            }
            Ok(out)
        }
        JobDescriptor::RawReducer(reducer) => {
            let input = job.input_format.encode_rows(&rows)?;
            let output = reducer.reduce_raw(input, ctx).await?;
            job.output_format.decode_rows(&output)
        }
    }
}

/// Agrupa filas consecutivas con la misma clave.
pub fn group_by_key(rows: Vec<Row>, key_columns: &[String]) -> Vec<(Row, Vec<Row>)> {
    let mut groups: Vec<(Row, Vec<Row>)> = Vec::new();
    for row in rows {
        let key: Row = key_columns
            .iter()
            .map(|c| (c.clone(), row.get(c).cloned().unwrap_or_default()))
            .collect();
        match groups.last_mut() {
            Some((last, group)) if *last == key => group.push(row),
            _ => groups.push((key, vec![row])),
        }
    }
    groups
}
