//! One-shot build pipeline: graph, bundles, page, disk

use std::{path::PathBuf, sync::Arc};

use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Config,
    emitter::{Emitter, RenderedBuild},
    error::{BuildError, BuildFailed, BuildResult, CycleWarning},
    graph_builder::{BuildContext, BuildMode, GraphBuildOutput, GraphBuilder},
    html::{HtmlEmitter, TemplateHtmlEmitter},
    manifest::Manifest,
};

/// Summary of a finished build
#[derive(Debug)]
pub struct BuildReport {
    pub manifest: Manifest,
    pub cycles: Vec<CycleWarning>,
    pub module_count: usize,
    pub output_dir: PathBuf,
}

/// Render the bundles of a walked graph and, when configured, the HTML page
pub fn render(
    config: &Config,
    built: &GraphBuildOutput,
    skip: &[String],
) -> BuildResult<RenderedBuild> {
    let mut rendered = Emitter::new(config).render(&built.graph, skip);
    attach_page(config, &mut rendered)?;
    Ok(rendered)
}

/// Add the HTML page for the rendered manifest, if one is configured
pub fn attach_page(config: &Config, rendered: &mut RenderedBuild) -> BuildResult<()> {
    if let Some(html) = &config.html {
        let page = TemplateHtmlEmitter::from_config(html, &config.root)?
            .emit(&rendered.manifest, &config.output.public_path)?;
        rendered.add_page(page);
    }
    Ok(())
}

/// Build every entry once and write the result to the output directory.
///
/// Any module failure aborts the build before anything is written; the error
/// is [`BuildFailed`] listing every failure and the entries it breaks.
pub async fn build(config: Config, cancel: CancellationToken) -> anyhow::Result<BuildReport> {
    let ctx = Arc::new(BuildContext::new(config)?);
    let built = GraphBuilder::new(Arc::clone(&ctx), BuildMode::OneShot)
        .with_cancellation(cancel.clone())
        .build()
        .await?;
    if !built.failures.is_empty() {
        for failure in &built.failures {
            warn!("{failure}");
        }
        return Err(BuildFailed(built.failures).into());
    }

    let config = &ctx.config;
    let rendered = render(config, &built, &[])?;
    if cancel.is_cancelled() {
        return Err(BuildError::Cancelled.into());
    }
    let output_dir = Emitter::new(config).write(&rendered, &cancel).await?;
    info!(
        "Built {} entries from {} modules",
        rendered.manifest.entries.len(),
        built.graph.len()
    );
    Ok(BuildReport {
        manifest: rendered.manifest,
        cycles: built.cycles,
        module_count: built.graph.len(),
        output_dir,
    })
}
