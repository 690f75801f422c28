//! Fn eval command - run one function over a package without its pipeline

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use kpt_core::Function;
use kpt_engine::Evaluator;

use super::{RunArgs, report_output};
use crate::display::Reporter;
use crate::error::{CliError, Result};

/// What `fn eval` runs and how it is configured
#[derive(Debug, Default)]
pub struct EvalFunction {
    pub image: Option<String>,
    pub exec: Option<String>,
    pub fn_config: Option<PathBuf>,
    /// `key=value` pairs given after `--`
    pub config_args: Vec<String>,
}

impl EvalFunction {
    fn build(self) -> Result<Function> {
        let config = match &self.fn_config {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    CliError::input(format!("cannot read {}: {}", path.display(), e))
                })?;
                let value = serde_yaml::from_str(&raw).map_err(|e| {
                    CliError::input(format!("invalid function config {}: {}", path.display(), e))
                })?;
                Some(value)
            }
            None => None,
        };

        let config_map = if self.config_args.is_empty() {
            None
        } else {
            Some(parse_config_args(&self.config_args)?)
        };

        Ok(Function {
            image: self.image,
            exec: self.exec,
            config,
            config_map,
            ..Default::default()
        })
    }
}

pub async fn run(
    pkg: &Path,
    function: EvalFunction,
    args: &RunArgs,
    cancel: &CancellationToken,
) -> Result<()> {
    let function = function.build()?;
    let mut options = args.render_options();
    // Naming a local executable on the command line is consent to run it
    if function.exec.is_some() {
        options.runner.allow_exec = true;
    }

    let output = Evaluator::new(options).eval(pkg, &function, cancel).await?;
    report_output(&mut Reporter::new(), pkg, &output)
}

fn parse_config_args(args: &[String]) -> Result<BTreeMap<String, String>> {
    args.iter()
        .map(|arg| match arg.split_once('=') {
            Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
            _ => Err(CliError::input_with_help(
                format!("invalid function argument '{}'", arg),
                "arguments after -- must be key=value pairs",
            )),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_args() {
        let map = parse_config_args(&["app=web".to_string(), "tier=".to_string()]).unwrap();
        assert_eq!(map.get("app").map(String::as_str), Some("web"));
        assert_eq!(map.get("tier").map(String::as_str), Some(""));

        assert!(parse_config_args(&["novalue".to_string()]).is_err());
        assert!(parse_config_args(&["=x".to_string()]).is_err());
    }

    #[test]
    fn test_build_reads_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fn-config.yaml");
        std::fs::write(
            &path,
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cfg\ndata:\n  app: web\n",
        )
        .unwrap();

        let function = EvalFunction {
            image: Some("set-labels:v0.2".to_string()),
            fn_config: Some(path),
            ..Default::default()
        }
        .build()
        .unwrap();

        let config = function.config.unwrap();
        assert_eq!(config["data"]["app"].as_str(), Some("web"));
        assert!(function.config_map.is_none());
    }
}
