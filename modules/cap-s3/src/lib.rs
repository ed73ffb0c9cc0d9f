//! `ext/s3`: object put / get / remove and bucket creation against AWS S3
//! or any S3-compatible endpoint.
//!
//! Credentials travel with every call (`{hostname?, access_key, secret_key,
//! region}`), so a script can talk to several stores in one run. Each call
//! is one heavy I/O token and one request attempt; the SDK's own retries are
//! disabled so the run's network cap stays meaningful.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::rc::Rc;

use alertscript_core::{arg, to_value, Accountant, Capability, EvalContext};
use alertscript_runner::{CapRegistry, RegistryError};
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::{ByteStream, DateTime};
use aws_sdk_s3::types::{BucketLocationConstraint, CreateBucketConfiguration};
use aws_sdk_s3::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const NAME: &str = "ext/s3";
const S3_HOST: &str = "s3.amazonaws.com";
const DEFAULT_REGION: &str = "us-east-1";

pub fn register(reg: &mut CapRegistry) -> Result<(), RegistryError> {
    reg.register(NAME, factory)
}

pub fn factory(
    acct: Rc<dyn Accountant>,
    _ctx: &EvalContext,
    _args: &[Value],
) -> anyhow::Result<Box<dyn Capability>> {
    Ok(Box::new(S3::new(acct)))
}

// ---------------------------------------------------------------------------
// Script-facing types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Creds {
    /// Endpoint host, optionally with a scheme; defaults to AWS.
    pub hostname: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

impl Creds {
    fn endpoint(&self) -> Option<String> {
        match self.hostname.as_str() {
            "" | S3_HOST => None,
            h if h.contains("://") => Some(h.to_string()),
            h => Some(format!("https://{h}")),
        }
    }

    fn region(&self) -> &str {
        if self.region.is_empty() {
            DEFAULT_REGION
        } else {
            &self.region
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PutOpts {
    pub metadata: HashMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub content_type: String,
    pub encoding: String,
    pub disposition: String,
    pub language: String,
    pub cache_control: String,
    pub redirect_location: String,
    /// RFC 3339 timestamp for object-lock retention.
    pub retain_until: String,
}

impl PutOpts {
    /// `k=v&k2=v2`, the form `x-amz-tagging` expects.
    fn tagging(&self) -> Option<String> {
        if self.tags.is_empty() {
            return None;
        }
        let mut ser = url::form_urlencoded::Serializer::new(String::new());
        for (k, v) in &self.tags {
            ser.append_pair(k, v);
        }
        Some(ser.finish())
    }

    fn retain_until(&self) -> anyhow::Result<Option<DateTime>> {
        if self.retain_until.is_empty() {
            return Ok(None);
        }
        let t = chrono::DateTime::parse_from_rfc3339(&self.retain_until)
            .map_err(|e| anyhow::anyhow!("s3.put: invalid retain_until '{}': {e}", self.retain_until))?;
        Ok(Some(DateTime::from_secs(t.timestamp())))
    }
}

#[derive(Debug, Default, Serialize, PartialEq)]
pub struct ObjectResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub version: String,
}

impl ObjectResult {
    fn dry_run() -> Self {
        Self {
            etag: "1".into(),
            version: "dry-run".into(),
            ..Default::default()
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

pub struct S3 {
    acct: Rc<dyn Accountant>,
}

impl S3 {
    pub fn new(acct: Rc<dyn Accountant>) -> Self {
        Self { acct }
    }

    fn client(&self, creds: &Creds) -> Client {
        let mut conf = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .credentials_provider(Credentials::new(
                &creds.access_key,
                &creds.secret_key,
                None,
                None,
                "alertscript",
            ))
            .region(Region::new(creds.region().to_string()))
            .retry_config(RetryConfig::disabled())
            .timeout_config(
                TimeoutConfig::builder()
                    .operation_timeout(self.acct.net_timeout())
                    .build(),
            );
        if let Some(endpoint) = creds.endpoint() {
            conf = conf.endpoint_url(endpoint).force_path_style(true);
        }
        Client::from_conf(conf.build())
    }

    /// Drive one SDK future to completion on a throwaway runtime.
    fn block_on<F: Future>(&self, fut: F) -> anyhow::Result<F::Output> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(rt.block_on(fut))
    }

    /// Count and log a failed request, then build the script-side error.
    fn failed(&self, op: &str, err: impl std::error::Error) -> anyhow::Error {
        let detail = DisplayErrorContext(&err).to_string();
        self.acct.net_io_err();
        self.acct.verbose(&format!("s3 error {detail}"));
        anyhow::anyhow!("s3.{op} failed: {detail}")
    }

    pub fn put(
        &self,
        creds: Option<Creds>,
        bucket: &str,
        key: &str,
        data: String,
        opts: PutOpts,
    ) -> anyhow::Result<ObjectResult> {
        let creds = creds.ok_or_else(|| anyhow::anyhow!("s3.put: missing credentials"))?;
        let retain = opts.retain_until()?;
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!("s3/put bucket {bucket}, key {key}"));
        if self.acct.is_dry_run() {
            return Ok(ObjectResult::dry_run());
        }

        let client = self.client(&creds);
        let req = client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(data.into_bytes()))
            .set_content_type(non_empty(&opts.content_type))
            .set_content_encoding(non_empty(&opts.encoding))
            .set_content_disposition(non_empty(&opts.disposition))
            .set_content_language(non_empty(&opts.language))
            .set_cache_control(non_empty(&opts.cache_control))
            .set_website_redirect_location(non_empty(&opts.redirect_location))
            .set_tagging(opts.tagging())
            .set_object_lock_retain_until_date(retain)
            .set_metadata((!opts.metadata.is_empty()).then_some(opts.metadata));

        let out = self
            .block_on(req.send())?
            .map_err(|e| self.failed("put", e))?;
        Ok(ObjectResult {
            etag: out.e_tag().unwrap_or_default().to_string(),
            version: out.version_id().unwrap_or_default().to_string(),
            ..Default::default()
        })
    }

    pub fn get(&self, creds: Option<Creds>, bucket: &str, key: &str) -> anyhow::Result<ObjectResult> {
        let creds = creds.ok_or_else(|| anyhow::anyhow!("s3.get: missing credentials"))?;
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!("s3/get bucket {bucket}, key {key}"));
        if self.acct.is_dry_run() {
            return Ok(ObjectResult::default());
        }

        let client = self.client(&creds);
        self.block_on(async {
            let out = client
                .get_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| self.failed("get", e))?;
            let etag = out.e_tag().unwrap_or_default().to_string();
            let version = out.version_id().unwrap_or_default().to_string();
            let content_type = out.content_type().unwrap_or_default().to_string();
            let metadata = out
                .metadata()
                .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                .unwrap_or_default();
            let body = out
                .body
                .collect()
                .await
                .map_err(|e| self.failed("get", e))?
                .into_bytes();
            Ok::<_, anyhow::Error>(ObjectResult {
                content: Some(String::from_utf8_lossy(&body).into_owned()),
                etag,
                content_type,
                metadata,
                version,
            })
        })?
    }

    pub fn remove(
        &self,
        creds: Option<Creds>,
        bucket: &str,
        key: &str,
        version: &str,
    ) -> anyhow::Result<ObjectResult> {
        let creds = creds.ok_or_else(|| anyhow::anyhow!("s3.remove: missing credentials"))?;
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!("s3/remove bucket {bucket}, key {key}"));
        if self.acct.is_dry_run() {
            return Ok(ObjectResult::dry_run());
        }

        let client = self.client(&creds);
        let req = client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .set_version_id(non_empty(version));
        self.block_on(req.send())?
            .map_err(|e| self.failed("remove", e))?;
        Ok(ObjectResult::default())
    }

    /// Create `bucket`; succeeds if it already exists and is ours.
    pub fn newbucket(&self, creds: Option<Creds>, bucket: &str) -> anyhow::Result<()> {
        let creds = creds.ok_or_else(|| anyhow::anyhow!("s3.newbucket: missing credentials"))?;
        let _io = self.acct.net_io_heavy()?;

        self.acct.diag(&format!("s3/new bucket {bucket}"));
        if self.acct.is_dry_run() {
            return Ok(());
        }

        let client = self.client(&creds);
        let region = creds.region();
        let location = (region != DEFAULT_REGION).then(|| {
            CreateBucketConfiguration::builder()
                .location_constraint(BucketLocationConstraint::from(region))
                .build()
        });
        self.block_on(async {
            let created = client
                .create_bucket()
                .bucket(bucket)
                .set_create_bucket_configuration(location)
                .send()
                .await;
            match created {
                Ok(_) => {
                    self.acct.diag(&format!("s3/new bucket {bucket} - created"));
                    Ok(())
                }
                Err(e) => {
                    if client.head_bucket().bucket(bucket).send().await.is_ok() {
                        self.acct.diag(&format!("s3/new bucket {bucket} - already exists"));
                        Ok(())
                    } else {
                        Err(self.failed("newbucket", e))
                    }
                }
            }
        })?
    }
}

impl Capability for S3 {
    fn methods(&self) -> &[&'static str] {
        &["put", "get", "remove", "newbucket"]
    }

    fn call(&mut self, method: &str, args: Vec<Value>) -> anyhow::Result<Value> {
        let creds: Option<Creds> = arg(&args, 0)?;
        let bucket: String = arg(&args, 1)?;
        match method {
            "put" => {
                let key: String = arg(&args, 2)?;
                let data: Option<String> = arg(&args, 3)?;
                let opts: Option<PutOpts> = arg(&args, 4)?;
                to_value(&self.put(creds, &bucket, &key, data.unwrap_or_default(), opts.unwrap_or_default())?)
            }
            "get" => {
                let key: String = arg(&args, 2)?;
                to_value(&self.get(creds, &bucket, &key)?)
            }
            "remove" => {
                let key: String = arg(&args, 2)?;
                let version: Option<String> = arg(&args, 3)?;
                to_value(&self.remove(creds, &bucket, &key, version.as_deref().unwrap_or(""))?)
            }
            "newbucket" => {
                self.newbucket(creds, &bucket)?;
                Ok(Value::Null)
            }
            _ => anyhow::bail!("unknown method '{method}'"),
        }
    }
}
