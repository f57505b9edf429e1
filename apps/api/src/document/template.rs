//! Template descriptor: which files a document needs and where defaults come from.

use reqwest::Client;
use tracing::{info, warn};

pub const MAIN_PATH: &str = "/main.typ";
pub const DATA_PATH: &str = "/template.yml";

const EMBEDDED_MAIN: &str = include_str!("../../templates/main.typ");
const EMBEDDED_DATA: &str = include_str!("../../templates/template.yml");

#[derive(Debug, Clone)]
pub struct TemplateDescriptor {
    /// Layout source handed to the compiler as the main file.
    pub main_path: String,
    /// Serialized structured data.
    pub data_path: String,
    pub default_main: String,
    pub default_data: String,
    /// Base URL serving both default files by name. Embedded defaults are used
    /// when unset or unreachable.
    pub defaults_url: Option<String>,
}

impl TemplateDescriptor {
    pub fn resume() -> Self {
        Self {
            main_path: MAIN_PATH.to_string(),
            data_path: DATA_PATH.to_string(),
            default_main: EMBEDDED_MAIN.to_string(),
            default_data: EMBEDDED_DATA.to_string(),
            defaults_url: None,
        }
    }

    pub fn with_defaults_url(mut self, url: Option<String>) -> Self {
        self.defaults_url = url;
        self
    }

    /// Files whose presence is required before the compiler may load.
    pub fn important_files(&self) -> [&str; 2] {
        [self.main_path.as_str(), self.data_path.as_str()]
    }

    fn embedded(&self, path: &str) -> &str {
        if path == self.main_path {
            &self.default_main
        } else {
            &self.default_data
        }
    }

    /// Default content for one of the important files.
    pub async fn default_content(&self, client: &Client, path: &str) -> String {
        let Some(base) = &self.defaults_url else {
            return self.embedded(path).to_string();
        };

        let url = format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        let fetched = async {
            let response = client.get(&url).send().await?.error_for_status()?;
            response.text().await
        };
        match fetched.await {
            Ok(body) => {
                info!("Fetched default {path} from {url}");
                body
            }
            Err(e) => {
                warn!("Falling back to embedded {path}: {e}");
                self.embedded(path).to_string()
            }
        }
    }
}
