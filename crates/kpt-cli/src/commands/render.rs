//! Render command - hydrate a package tree by running its pipelines

use std::path::Path;
use tokio_util::sync::CancellationToken;

use kpt_engine::Renderer;

use super::{RunArgs, report_output};
use crate::display::Reporter;
use crate::error::Result;

pub async fn run(pkg: &Path, args: &RunArgs, cancel: &CancellationToken) -> Result<()> {
    let output = Renderer::new(args.render_options())
        .render(pkg, cancel)
        .await?;
    report_output(&mut Reporter::new(), pkg, &output)
}
