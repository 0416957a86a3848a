//! Settings and session fixtures.

use std::path::Path;
use std::sync::Arc;

use crate::config::ParameterSet;
use crate::errors::ConfigurationError;
use crate::session::{SessionContext, SessionLayout};
use crate::stages::PipelineToggles;

/// Settings for a two-level run with projections.
///
/// `{scratch}` and `{durable}` are filled in by [`sample_params`].
pub const SAMPLE_CONFIG: &str = r#"
n_levels = 2
do_proj = true
n_batches = 3
algorithms = ["glm", "gam", "rf", "maxent"]
nesting_methods = ["covariate", "multiply", "none"]
scenarios = ["ssp126", "ssp585"]
periods = ["2041-2070", "2071-2100"]

[paths]
scratch = "{scratch}"
durable = "{durable}"
pipeline = "/opt/sdm/pipeline"

[settings]
update_command = "/opt/sdm/pipeline/update_settings.sh"

[sync]
exclude = "tmp/, *.aux.xml"

[resources.regional_fit]
time = "2-00:00:00"
"#;

/// [`SAMPLE_CONFIG`] rooted under `root`.
///
/// # Errors
///
/// Returns an error if the generated TOML does not parse.
pub fn sample_params(root: &Path) -> Result<ParameterSet, ConfigurationError> {
    ParameterSet::from_toml(&render(SAMPLE_CONFIG, root))
}

/// [`SAMPLE_CONFIG`] rooted under `root` with extra TOML appended.
///
/// Appended keys land in the last table of the sample; start `extra` with a
/// table header to add top-level keys elsewhere.
///
/// # Errors
///
/// Returns an error if the generated TOML does not parse.
pub fn sample_params_with(root: &Path, extra: &str) -> Result<ParameterSet, ConfigurationError> {
    let mut content = render(SAMPLE_CONFIG, root);
    content.push('\n');
    content.push_str(extra);
    ParameterSet::from_toml(&content)
}

fn render(template: &str, root: &Path) -> String {
    template
        .replace("{scratch}", &root.join("scratch").display().to_string())
        .replace("{durable}", &root.join("durable").display().to_string())
}

/// A session with its directories created under a caller-owned root.
#[derive(Debug, Clone)]
pub struct TestSession {
    /// The shared context.
    pub context: Arc<SessionContext>,
    /// Toggles of the session's settings.
    pub toggles: PipelineToggles,
    /// The settings.
    pub params: ParameterSet,
}

impl TestSession {
    /// Creates the session from `params`.
    ///
    /// # Errors
    ///
    /// Returns an error if the settings are incomplete or the directories
    /// cannot be created.
    pub fn new(params: ParameterSet) -> Result<Self, crate::errors::SdmflowError> {
        let context = SessionContext::from_params(&params)?;
        context.layout().ensure_dirs()?;
        let toggles = PipelineToggles::from_params(&params)?;
        Ok(Self {
            context: Arc::new(context),
            toggles,
            params,
        })
    }

    /// The state layout.
    #[must_use]
    pub fn layout(&self) -> &SessionLayout {
        self.context.layout()
    }

    /// Writes a batch's entity list and count as the settings step would.
    ///
    /// # Errors
    ///
    /// Returns an error if a file cannot be written.
    pub fn write_entities(&self, names: &[&str]) -> std::io::Result<()> {
        let layout = self.layout();
        let mut body = names.join("\n");
        body.push('\n');
        std::fs::write(layout.entity_list(), body)?;
        std::fs::write(layout.entity_count(), format!("{}\n", names.len()))
    }
}
