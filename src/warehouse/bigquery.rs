//! BigQuery implementation of [`Warehouse`] over the v2 REST API.
//!
//! All calls are blocking. Load jobs are started with a resumable media upload
//! and polled until they reach `DONE`; DDL statements run through `jobs.query`
//! and are likewise waited on, so a column promotion has landed before the
//! next load is issued. No request timeout is applied.

use std::{env, fs::File, path::Path, thread, time::Duration};

use log::debug;
use reqwest::{
    StatusCode,
    blocking::{Client, Response},
    header::{CONTENT_TYPE, LOCATION},
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{
    DatasetId, FieldType, LoadConfig, SchemaUpdateOption, TableId, TableSchema, Warehouse,
    WarehouseError, WriteDisposition,
};

pub const API_ROOT: &str = "https://bigquery.googleapis.com/bigquery/v2";
pub const UPLOAD_ROOT: &str = "https://bigquery.googleapis.com/upload/bigquery/v2";
pub const TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct BigQueryClient {
    http: Client,
    project: String,
    token: String,
    api_root: String,
    upload_root: String,
    location: Option<String>,
    poll_interval: Duration,
}

impl BigQueryClient {
    pub fn new(project: impl Into<String>, token: impl Into<String>) -> Result<Self, WarehouseError> {
        let http = Client::builder().timeout(None::<Duration>).build()?;
        Ok(Self {
            http,
            project: project.into(),
            token: token.into(),
            api_root: API_ROOT.to_string(),
            upload_root: UPLOAD_ROOT.to_string(),
            location: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Builds a client with the access token from the environment or `.env`.
    pub fn from_env(project: impl Into<String>) -> Result<Self, WarehouseError> {
        dotenvy::dotenv().ok();
        let token = env::var(TOKEN_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| {
                WarehouseError::Credentials(format!(
                    "set {TOKEN_ENV} (for example from `gcloud auth print-access-token`)"
                ))
            })?;
        Self::new(project, token.trim())
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Points the client at another API root, such as a local emulator.
    pub fn with_endpoints(mut self, api_root: impl Into<String>, upload_root: impl Into<String>) -> Self {
        self.api_root = api_root.into().trim_end_matches('/').to_string();
        self.upload_root = upload_root.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    fn table_url(&self, table: &TableId) -> String {
        format!(
            "{}/projects/{}/datasets/{}/tables/{}",
            self.api_root, table.project, table.dataset, table.table
        )
    }

    fn get_table(&self, table: &TableId) -> Result<Option<TableResource>, WarehouseError> {
        let response = self
            .http
            .get(self.table_url(table))
            .bearer_auth(&self.token)
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Ok(Some(check(response)?.json()?))
    }

    fn run_query(&self, sql: &str) -> Result<(), WarehouseError> {
        debug!("Running statement: {sql}");
        let body = QueryRequest {
            query: sql,
            use_legacy_sql: false,
            location: self.location.as_deref(),
        };
        let response: QueryResponse = check(
            self.http
                .post(format!("{}/projects/{}/queries", self.api_root, self.project))
                .bearer_auth(&self.token)
                .json(&body)
                .send()?,
        )?
        .json()?;
        if !response.errors.is_empty() {
            debug!("Statement reported {} warning(s)", response.errors.len());
        }
        if response.job_complete {
            return Ok(());
        }
        let reference = response.job_reference.ok_or_else(|| {
            WarehouseError::Decode("incomplete query response without a job reference".to_string())
        })?;
        self.wait_for_job(&reference).map(|_| ())
    }

    fn wait_for_job(&self, reference: &JobReference) -> Result<Job, WarehouseError> {
        let url = format!(
            "{}/projects/{}/jobs/{}",
            self.api_root, reference.project_id, reference.job_id
        );
        loop {
            let mut request = self.http.get(&url).bearer_auth(&self.token);
            if let Some(location) = reference.location.as_deref().or(self.location.as_deref()) {
                request = request.query(&[("location", location)]);
            }
            let job: Job = check(request.send()?)?.json()?;
            if job.status.state == "DONE" {
                return match failure_from(job.status.error_result.as_ref(), &job.status.errors) {
                    Some(err) => Err(err),
                    None => Ok(job),
                };
            }
            debug!(
                "Job {} is {}; polling again in {:?}",
                reference.job_id, job.status.state, self.poll_interval
            );
            thread::sleep(self.poll_interval);
        }
    }
}

impl Warehouse for BigQueryClient {
    fn load_file(
        &self,
        path: &Path,
        table: &TableId,
        config: &LoadConfig,
    ) -> Result<u64, WarehouseError> {
        let job_id = format!("taxi_ingest_load_{}", Uuid::new_v4().simple());
        let body = load_job_request(&self.project, self.location.as_deref(), &job_id, table, config);
        let response = check(
            self.http
                .post(format!(
                    "{}/projects/{}/jobs?uploadType=resumable",
                    self.upload_root, self.project
                ))
                .bearer_auth(&self.token)
                .header("X-Upload-Content-Type", "application/octet-stream")
                .json(&body)
                .send()?,
        )?;
        let session = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                WarehouseError::Decode("upload session response has no Location header".to_string())
            })?
            .to_string();

        let file = File::open(path).map_err(|source| WarehouseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let job: Job = check(
            self.http
                .put(&session)
                .bearer_auth(&self.token)
                .header(CONTENT_TYPE, "application/octet-stream")
                .body(file)
                .send()?,
        )?
        .json()?;
        debug!("Started load job {} for {table}", job.job_reference.job_id);

        let job = self.wait_for_job(&job.job_reference)?;
        Ok(job.output_rows())
    }

    fn table_schema(&self, table: &TableId) -> Result<TableSchema, WarehouseError> {
        let resource = self
            .get_table(table)?
            .ok_or_else(|| WarehouseError::NotFound {
                resource: format!("table {table}"),
            })?;
        Ok(resource.schema.unwrap_or_default())
    }

    fn table_row_count(&self, table: &TableId) -> Result<u64, WarehouseError> {
        let resource = self
            .get_table(table)?
            .ok_or_else(|| WarehouseError::NotFound {
                resource: format!("table {table}"),
            })?;
        parse_count(resource.num_rows.as_deref())
    }

    fn alter_column_type(
        &self,
        table: &TableId,
        column: &str,
        new_type: &FieldType,
    ) -> Result<(), WarehouseError> {
        self.run_query(&alter_column_statement(table, column, new_type))
    }

    fn table_exists(&self, table: &TableId) -> Result<bool, WarehouseError> {
        Ok(self.get_table(table)?.is_some())
    }

    fn ensure_dataset(&self, dataset: &DatasetId, location: &str) -> Result<(), WarehouseError> {
        let body = DatasetInsert {
            dataset_reference: DatasetReference {
                project_id: &dataset.project,
                dataset_id: &dataset.dataset,
            },
            location,
        };
        let response = self
            .http
            .post(format!("{}/projects/{}/datasets", self.api_root, dataset.project))
            .bearer_auth(&self.token)
            .json(&body)
            .send()?;
        if response.status() == StatusCode::CONFLICT {
            debug!("Dataset {dataset} already exists");
            return Ok(());
        }
        check(response).map(|_| ())
    }

    fn drop_table_if_exists(&self, table: &TableId) -> Result<(), WarehouseError> {
        let response = self
            .http
            .delete(self.table_url(table))
            .bearer_auth(&self.token)
            .send()?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response).map(|_| ())
    }
}

pub fn alter_column_statement(table: &TableId, column: &str, new_type: &FieldType) -> String {
    format!("ALTER TABLE `{table}` ALTER COLUMN `{column}` SET DATA TYPE {new_type}")
}

fn load_job_request<'a>(
    project: &'a str,
    location: Option<&'a str>,
    job_id: &'a str,
    table: &'a TableId,
    config: &'a LoadConfig,
) -> JobInsert<'a> {
    JobInsert {
        job_reference: JobReferenceRef {
            project_id: project,
            job_id,
            location,
        },
        configuration: JobConfiguration {
            load: LoadJobConfiguration {
                destination_table: TableReference {
                    project_id: &table.project,
                    dataset_id: &table.dataset,
                    table_id: &table.table,
                },
                source_format: "PARQUET",
                autodetect: config.schema.is_auto_detect(),
                write_disposition: config.write_disposition,
                time_partitioning: TimePartitioning {
                    kind: "DAY",
                    field: &config.partition_field,
                },
                schema_update_options: &config.schema_update_options,
                schema: config.schema.explicit_schema(),
            },
        },
    }
}

fn parse_count(value: Option<&str>) -> Result<u64, WarehouseError> {
    match value {
        None => Ok(0),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| WarehouseError::Decode(format!("invalid row count '{raw}'"))),
    }
}

fn check(response: Response) -> Result<Response, WarehouseError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) => describe(&envelope.error.message, &envelope.error.errors),
        Err(_) => body,
    };
    Err(match status {
        StatusCode::BAD_REQUEST => WarehouseError::Rejected { message },
        StatusCode::NOT_FOUND => WarehouseError::NotFound { resource: message },
        other => WarehouseError::Status {
            status: other.as_u16(),
            message,
        },
    })
}

/// Turns a finished job's `errorResult` into a [`WarehouseError`].
///
/// Only `errorResult` marks a failed job; `errors` may hold warnings on a
/// successful one and is folded into the message when the job did fail.
fn failure_from(result: Option<&ErrorProto>, errors: &[ErrorProto]) -> Option<WarehouseError> {
    let primary = result?;
    let message = describe(&primary.message, errors);
    Some(match primary.reason.as_deref() {
        Some("notFound") => WarehouseError::NotFound { resource: message },
        Some("accessDenied") => WarehouseError::Status {
            status: 403,
            message,
        },
        Some("backendError" | "internalError") => WarehouseError::Status {
            status: 500,
            message,
        },
        _ => WarehouseError::Rejected { message },
    })
}

fn describe(message: &str, errors: &[ErrorProto]) -> String {
    let mut parts = vec![message.to_string()];
    for error in errors {
        if !error.message.is_empty() && !parts.contains(&error.message) {
            parts.push(error.message.clone());
        }
    }
    parts.retain(|part| !part.is_empty());
    parts.join("; ")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    #[serde(default)]
    schema: Option<TableSchema>,
    #[serde(default)]
    num_rows: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobReference {
    project_id: String,
    job_id: String,
    #[serde(default)]
    location: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Job {
    job_reference: JobReference,
    #[serde(default)]
    status: JobStatus,
    #[serde(default)]
    statistics: Option<JobStatistics>,
}

impl Job {
    fn output_rows(&self) -> u64 {
        self.statistics
            .as_ref()
            .and_then(|stats| stats.load.as_ref())
            .and_then(|load| load.output_rows.as_deref())
            .and_then(|rows| rows.parse().ok())
            .unwrap_or(0)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobStatus {
    #[serde(default)]
    state: String,
    #[serde(default)]
    error_result: Option<ErrorProto>,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
struct JobStatistics {
    #[serde(default)]
    load: Option<LoadStatistics>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoadStatistics {
    #[serde(default)]
    output_rows: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorProto {
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ApiError,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_reference: Option<JobReference>,
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    errors: Vec<ErrorProto>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetInsert<'a> {
    dataset_reference: DatasetReference<'a>,
    location: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobInsert<'a> {
    job_reference: JobReferenceRef<'a>,
    configuration: JobConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobReferenceRef<'a> {
    project_id: &'a str,
    job_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Serialize)]
struct JobConfiguration<'a> {
    load: LoadJobConfiguration<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoadJobConfiguration<'a> {
    destination_table: TableReference<'a>,
    source_format: &'static str,
    autodetect: bool,
    write_disposition: WriteDisposition,
    time_partitioning: TimePartitioning<'a>,
    schema_update_options: &'a [SchemaUpdateOption],
    #[serde(skip_serializing_if = "Option::is_none")]
    schema: Option<&'a TableSchema>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TableReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
    table_id: &'a str,
}

#[derive(Serialize)]
struct TimePartitioning<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    field: &'a str,
}
