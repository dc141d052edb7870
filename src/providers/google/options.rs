//! Configuration and endpoint resolution for the Google adapter.

use std::fmt;
use std::str::FromStr;

use crate::sse_stream::DEFAULT_MAX_EVENT_BYTES;
use crate::Error;

const DIRECT_HOST: &str = "https://generativelanguage.googleapis.com";
const VERTEX_GLOBAL_HOST: &str = "https://aiplatform.googleapis.com";
/// The Gemini API serves `v1` and `v1beta`, not `v1beta1`.
const DEFAULT_DIRECT_VERSION: &str = "v1beta";
const DEFAULT_VERTEX_VERSION: &str = "v1beta1";
/// Project-scoped Vertex URLs always use this version.
const VERTEX_PROJECT_VERSION: &str = "v1beta1";
const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Which Google backend serves the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProviderType {
    /// The Gemini API at generativelanguage.googleapis.com.
    #[default]
    Direct,
    /// Vertex AI, either global or project-scoped.
    VertexAI,
}

impl FromStr for ProviderType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "direct" | "gemini" => Ok(ProviderType::Direct),
            "vertex" | "vertexai" | "vertex-ai" => Ok(ProviderType::VertexAI),
            other => Err(Error::config(format!("unknown Google provider type '{other}'"))),
        }
    }
}

/// The RPC invoked on the model resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoogleAction {
    Generate,
    Stream,
}

impl GoogleAction {
    fn method(self) -> &'static str {
        match self {
            GoogleAction::Generate => "generateContent",
            GoogleAction::Stream => "streamGenerateContent",
        }
    }
}

/// The single credential header attached to a request.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthHeader {
    ApiKey(String),
    Bearer(String),
}

impl AuthHeader {
    pub fn name(&self) -> &'static str {
        match self {
            AuthHeader::ApiKey(_) => "x-goog-api-key",
            AuthHeader::Bearer(_) => "Authorization",
        }
    }

    pub fn value(&self) -> String {
        match self {
            AuthHeader::ApiKey(key) => key.clone(),
            AuthHeader::Bearer(token) => format!("Bearer {token}"),
        }
    }
}

impl fmt::Debug for AuthHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple(self.name()).field(&"<redacted>").finish()
    }
}

/// A fully resolved request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub auth: AuthHeader,
}

/// Options for [`GoogleModel`](super::GoogleModel).
///
/// Nothing is validated at construction. Missing credentials surface as
/// [`Error::Request`] on the first call.
#[derive(Clone, Default)]
pub struct GoogleModelOptions {
    pub api_key: Option<String>,
    pub access_token: Option<String>,
    pub project_id: Option<String>,
    pub location: Option<String>,
    pub provider_type: ProviderType,
    /// Overrides the API version segment of Gemini API and global Vertex
    /// URLs. Project-scoped Vertex URLs stay on `v1beta1`.
    pub api_version: Option<String>,
    /// Replaces the scheme and host of the resolved URL. Used to point the
    /// adapter at a mock server.
    pub base_url: Option<String>,
    /// Replaces the default HTTP client.
    pub http_client: Option<reqwest::Client>,
    /// Largest single streamed event accepted. Defaults to
    /// [`DEFAULT_MAX_EVENT_BYTES`].
    pub max_stream_event_bytes: Option<usize>,
}

impl GoogleModelOptions {
    /// Options for the Gemini API authenticated with an API key.
    pub fn direct(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            ..Self::default()
        }
    }

    /// Options for global Vertex AI authenticated with an API key.
    pub fn vertex_global(api_key: impl Into<String>) -> Self {
        Self {
            api_key: Some(api_key.into()),
            provider_type: ProviderType::VertexAI,
            ..Self::default()
        }
    }

    /// Options for a project-scoped Vertex AI endpoint.
    pub fn vertex_project(
        project_id: impl Into<String>,
        location: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            access_token: Some(access_token.into()),
            project_id: Some(project_id.into()),
            location: Some(location.into()),
            provider_type: ProviderType::VertexAI,
            ..Self::default()
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = Some(version.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_max_stream_event_bytes(mut self, max_event_bytes: usize) -> Self {
        self.max_stream_event_bytes = Some(max_event_bytes);
        self
    }

    /// Build options from the process environment.
    ///
    /// Reads `GOOGLE_API_KEY`, `VERTEX_ACCESS_TOKEN`, `VERTEX_PROJECT_ID`,
    /// `VERTEX_LOCATION`, `GOOGLE_PROVIDER_TYPE` and `GOOGLE_API_VERSION`.
    /// When the provider type is not given, it is inferred from whether a
    /// Vertex project is configured.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let project_id = var("VERTEX_PROJECT_ID");
        let location = var("VERTEX_LOCATION");
        let provider_type = match var("GOOGLE_PROVIDER_TYPE") {
            Some(value) => value.parse()?,
            None if project_id.is_some() => ProviderType::VertexAI,
            None => ProviderType::Direct,
        };

        if project_id.is_some() != location.is_some() {
            return Err(Error::config(
                "VERTEX_PROJECT_ID and VERTEX_LOCATION must be set together",
            ));
        }

        Ok(Self {
            api_key: var("GOOGLE_API_KEY"),
            access_token: var("VERTEX_ACCESS_TOKEN"),
            project_id,
            location,
            provider_type,
            api_version: var("GOOGLE_API_VERSION"),
            base_url: None,
            http_client: None,
            max_stream_event_bytes: None,
        })
    }

    /// Fill `access_token` from Application Default Credentials.
    pub async fn with_application_default_credentials(mut self) -> Result<Self, Error> {
        let provider = gcp_auth::provider().await.map_err(|e| {
            Error::config(format!("failed to load application default credentials: {e}"))
        })?;
        let token = provider
            .token(&[CLOUD_PLATFORM_SCOPE])
            .await
            .map_err(|e| Error::request(format!("failed to obtain access token: {e}")))?;
        self.access_token = Some(token.as_str().to_string());
        Ok(self)
    }

    /// Resolve the URL and credential header for `model` and `action`.
    pub fn resolve_endpoint(&self, model: &str, action: GoogleAction) -> Result<Endpoint, Error> {
        let method = action.method();
        let (url, auth) = match self.provider_type {
            ProviderType::Direct => {
                let version = self.version_or(DEFAULT_DIRECT_VERSION);
                let key = non_empty(&self.api_key)
                    .ok_or_else(|| Error::request("the Gemini API requires an API key"))?;
                (
                    format!("{DIRECT_HOST}/{version}/models/{model}:{method}"),
                    AuthHeader::ApiKey(key.to_string()),
                )
            }
            ProviderType::VertexAI => {
                match (non_empty(&self.project_id), non_empty(&self.location)) {
                    (Some(project), Some(location)) => {
                        let token = non_empty(&self.access_token).ok_or_else(|| {
                            Error::request("project-scoped Vertex AI requires an access token")
                        })?;
                        (
                            format!(
                                "https://{location}-aiplatform.googleapis.com/{VERTEX_PROJECT_VERSION}/projects/{project}/locations/{location}/publishers/google/models/{model}:{method}"
                            ),
                            AuthHeader::Bearer(token.to_string()),
                        )
                    }
                    _ => {
                        let auth = match (non_empty(&self.api_key), non_empty(&self.access_token)) {
                            (Some(key), _) => AuthHeader::ApiKey(key.to_string()),
                            (None, Some(token)) => AuthHeader::Bearer(token.to_string()),
                            (None, None) => {
                                return Err(Error::request(
                                    "Vertex AI requires an API key or an access token",
                                ))
                            }
                        };
                        let version = self.version_or(DEFAULT_VERTEX_VERSION);
                        (
                            format!(
                                "{VERTEX_GLOBAL_HOST}/{version}/publishers/google/models/{model}:{method}"
                            ),
                            auth,
                        )
                    }
                }
            }
        };

        let mut url = match &self.base_url {
            Some(base) => replace_origin(&url, base),
            None => url,
        };
        if action == GoogleAction::Stream {
            url.push_str("?alt=sse");
        }

        Ok(Endpoint { url, auth })
    }

    pub(crate) fn client(&self) -> Result<reqwest::Client, Error> {
        match &self.http_client {
            Some(client) => Ok(client.clone()),
            None => reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(60))
                .build()
                .map_err(|e| Error::config(format!("failed to build HTTP client: {e}"))),
        }
    }

    pub(crate) fn max_stream_event_bytes(&self) -> usize {
        self.max_stream_event_bytes
            .unwrap_or(DEFAULT_MAX_EVENT_BYTES)
    }

    fn version_or<'a>(&'a self, default: &'a str) -> &'a str {
        non_empty(&self.api_version).unwrap_or(default)
    }
}

impl fmt::Debug for GoogleModelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |value: &Option<String>| value.as_ref().map(|_| "<redacted>");
        f.debug_struct("GoogleModelOptions")
            .field("api_key", &redact(&self.api_key))
            .field("access_token", &redact(&self.access_token))
            .field("project_id", &self.project_id)
            .field("location", &self.location)
            .field("provider_type", &self.provider_type)
            .field("api_version", &self.api_version)
            .field("base_url", &self.base_url)
            .field("max_stream_event_bytes", &self.max_stream_event_bytes)
            .finish_non_exhaustive()
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|value| !value.is_empty())
}

/// Swap the scheme and host of `url` for `base`, keeping the path.
fn replace_origin(url: &str, base: &str) -> String {
    let path_start = url
        .find("://")
        .and_then(|scheme_end| url[scheme_end + 3..].find('/').map(|i| scheme_end + 3 + i))
        .unwrap_or(url.len());
    format!("{}{}", base.trim_end_matches('/'), &url[path_start..])
}
