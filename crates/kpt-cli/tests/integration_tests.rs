//! Integration tests for CLI commands

use std::fs;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

/// Helper to run the kpt binary
fn kpt(args: &[&str]) -> std::process::Output {
    kpt_in(None, args)
}

fn kpt_in(cwd: Option<&Path>, args: &[&str]) -> std::process::Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_kpt"));
    command.args(args).env_remove("RUST_LOG");
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }
    command.output().expect("Failed to execute kpt")
}

fn write(dir: &Path, rel: &str, content: &str) {
    let path = dir.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

const DEPLOY: &str = "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web # frontend\nspec:\n  replicas: 1\n";

/// A package whose pipeline scales the deployment with a shell script
fn scaled_package() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "Kptfile",
        "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\npipeline:\n  mutators:\n  - exec: sh scale.sh\n",
    );
    write(dir.path(), "scale.sh", "sed 's/replicas: 1/replicas: 3/'\n");
    write(dir.path(), "deploy.yaml", DEPLOY);
    dir
}

mod render_command {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_render_in_place() {
        let pkg = scaled_package();
        let path = pkg.path().to_str().unwrap();

        let output = kpt(&["render", path, "--allow-exec"]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        let deploy = fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap();
        assert!(deploy.contains("replicas: 3"));
        assert!(deploy.contains("name: web # frontend"));
        assert!(stderr(&output).contains("[PASS] sh scale.sh"));
        assert!(stdout(&output).is_empty());
    }

    #[test]
    fn test_render_exec_requires_allow_exec() {
        let pkg = scaled_package();

        let output = kpt(&["render", pkg.path().to_str().unwrap()]);

        assert_eq!(output.status.code(), Some(1));
        assert!(stderr(&output).contains("--allow-exec"));
        assert_eq!(fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap(), DEPLOY);
    }

    #[cfg(unix)]
    #[test]
    fn test_render_to_stdout_leaves_package_untouched() {
        let pkg = scaled_package();

        let output = kpt(&[
            "render",
            pkg.path().to_str().unwrap(),
            "--allow-exec",
            "-o",
            "stdout",
        ]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        let out = stdout(&output);
        assert!(out.contains("kind: ResourceList"));
        assert!(out.contains("replicas: 3"));
        assert_eq!(fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap(), DEPLOY);
    }

    #[cfg(unix)]
    #[test]
    fn test_render_writes_results_file() {
        let pkg = scaled_package();
        let results = TempDir::new().unwrap();

        let output = kpt(&[
            "render",
            pkg.path().to_str().unwrap(),
            "--allow-exec",
            "--results-dir",
            results.path().to_str().unwrap(),
        ]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        let recorded = fs::read_to_string(results.path().join("results.yaml")).unwrap();
        assert!(recorded.contains("kind: FunctionResultList"));
        assert!(recorded.contains("execPath: sh scale.sh"));
    }

    #[cfg(unix)]
    #[test]
    fn test_render_validator_rejection_exit_code() {
        let pkg = scaled_package();
        write(
            pkg.path(),
            "Kptfile",
            "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\npipeline:\n  mutators:\n  - exec: sh scale.sh\n  validators:\n  - exec: sh check.sh\n",
        );
        write(
            pkg.path(),
            "check.sh",
            "cat > /dev/null\ncat <<'EOF'\napiVersion: config.kubernetes.io/v1\nkind: ResourceList\nitems: []\nresults:\n- message: replicas must be odd and below 3\n  severity: error\nEOF\nexit 1\n",
        );

        let output = kpt(&["render", pkg.path().to_str().unwrap(), "--allow-exec"]);

        assert_eq!(output.status.code(), Some(3));
        assert!(stderr(&output).contains("replicas must be odd and below 3"));
        assert_eq!(fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap(), DEPLOY);
    }

    #[cfg(unix)]
    #[test]
    fn test_render_function_failure_exit_code() {
        let pkg = scaled_package();
        write(pkg.path(), "scale.sh", "echo 'cannot scale' >&2\nexit 2\n");

        let output = kpt(&["render", pkg.path().to_str().unwrap(), "--allow-exec"]);

        assert_eq!(output.status.code(), Some(1));
        let err = stderr(&output);
        assert!(err.contains("sh scale.sh"), "{}", err);
        assert!(err.contains("cannot scale"), "{}", err);
    }

    #[test]
    fn test_render_missing_kptfile() {
        let dir = TempDir::new().unwrap();

        let output = kpt(&["render", dir.path().to_str().unwrap()]);

        assert_eq!(output.status.code(), Some(1));
        assert!(stderr(&output).contains("kpt init"));
    }
}

mod fn_eval_command {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn test_eval_exec_with_config_args() {
        let pkg = TempDir::new().unwrap();
        write(
            pkg.path(),
            "Kptfile",
            "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: app\n",
        );
        write(pkg.path(), "deploy.yaml", DEPLOY);
        // Takes the replica count from the ConfigMap built out of the trailing args
        write(
            pkg.path(),
            "scale.sh",
            "input=$(cat)\ncount=$(printf '%s\\n' \"$input\" | grep 'count:' | head -n 1 | tr -cd '0-9')\nprintf '%s\\n' \"$input\" | sed \"s/replicas: 1/replicas: $count/\"\n",
        );

        let output = kpt(&[
            "fn",
            "eval",
            pkg.path().to_str().unwrap(),
            "--exec",
            "sh scale.sh",
            "--",
            "count=5",
        ]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        let deploy = fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap();
        assert!(deploy.contains("replicas: 5"), "{}", deploy);
    }

    #[cfg(unix)]
    #[test]
    fn test_eval_ignores_package_pipeline() {
        let pkg = scaled_package();
        write(pkg.path(), "noop.sh", "cat\n");

        let output = kpt(&[
            "fn",
            "eval",
            pkg.path().to_str().unwrap(),
            "--exec",
            "sh noop.sh",
        ]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        let deploy = fs::read_to_string(pkg.path().join("deploy.yaml")).unwrap();
        assert!(deploy.contains("replicas: 1"));
    }

    #[test]
    fn test_eval_requires_a_function() {
        let pkg = scaled_package();

        let output = kpt(&["fn", "eval", pkg.path().to_str().unwrap()]);

        assert!(!output.status.success());
        assert!(stderr(&output).contains("--image"));
    }

    #[test]
    fn test_eval_rejects_malformed_args() {
        let pkg = scaled_package();

        let output = kpt(&[
            "fn",
            "eval",
            pkg.path().to_str().unwrap(),
            "--exec",
            "sh scale.sh",
            "--",
            "novalue",
        ]);

        assert_eq!(output.status.code(), Some(1));
        assert!(stderr(&output).contains("key=value"));
    }
}

mod init_command {
    use super::*;

    #[test]
    fn test_init_creates_kptfile() {
        let temp = TempDir::new().unwrap();
        let pkg = temp.path().join("frontend");

        let output = kpt(&[
            "init",
            pkg.to_str().unwrap(),
            "--description",
            "web frontend",
        ]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        let kptfile = fs::read_to_string(pkg.join("Kptfile")).unwrap();
        assert!(kptfile.contains("apiVersion: kpt.dev/v1"));
        assert!(kptfile.contains("name: frontend"));
        assert!(kptfile.contains("description: web frontend"));
    }

    #[test]
    fn test_init_current_directory() {
        let temp = TempDir::new().unwrap();
        let pkg = temp.path().join("backend");
        fs::create_dir(&pkg).unwrap();

        let output = kpt_in(Some(&pkg), &["init"]);

        assert!(output.status.success(), "stderr: {}", stderr(&output));
        assert!(fs::read_to_string(pkg.join("Kptfile")).unwrap().contains("name: backend"));
    }

    #[test]
    fn test_init_existing_package_fails() {
        let pkg = scaled_package();

        let output = kpt(&["init", pkg.path().to_str().unwrap()]);

        assert_eq!(output.status.code(), Some(1));
        assert!(stderr(&output).contains("already has a Kptfile"));
    }
}

#[cfg(unix)]
mod get_update_commands {
    use super::*;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "kpt")
            .env("GIT_AUTHOR_EMAIL", "kpt@example.com")
            .env("GIT_COMMITTER_NAME", "kpt")
            .env("GIT_COMMITTER_EMAIL", "kpt@example.com")
            .output()
            .expect("Failed to execute git");
        assert!(
            output.status.success(),
            "git {:?}: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    /// Upstream repo with an `nginx` package tagged v1 and v2
    fn upstream_repo(root: &Path) -> std::path::PathBuf {
        let repo = root.join("upstream.git");
        fs::create_dir_all(&repo).unwrap();
        git(&repo, &["init", "--quiet"]);
        git(&repo, &["checkout", "--quiet", "-b", "main"]);
        git(&repo, &["config", "commit.gpgsign", "false"]);

        write(
            &repo,
            "nginx/Kptfile",
            "apiVersion: kpt.dev/v1\nkind: Kptfile\nmetadata:\n  name: nginx\n",
        );
        write(&repo, "nginx/deploy.yaml", DEPLOY);
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "--quiet", "-m", "v1"]);
        git(&repo, &["tag", "v1"]);

        write(
            &repo,
            "nginx/deploy.yaml",
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web # frontend\nspec:\n  replicas: 1\n  strategy:\n    type: Recreate\n",
        );
        git(&repo, &["commit", "--quiet", "-am", "v2"]);
        git(&repo, &["tag", "v2"]);
        repo
    }

    #[test]
    fn test_get_then_update() {
        let temp = TempDir::new().unwrap();
        let repo = upstream_repo(temp.path());
        let cache = temp.path().join("cache");
        let dest = temp.path().join("work/web");
        fs::create_dir_all(temp.path().join("work")).unwrap();
        let upstream = format!("{}/nginx@v1", repo.display());

        let output = kpt(&[
            "get",
            &upstream,
            dest.to_str().unwrap(),
            "--cache-dir",
            cache.to_str().unwrap(),
        ]);
        assert!(output.status.success(), "stderr: {}", stderr(&output));

        let kptfile = fs::read_to_string(dest.join("Kptfile")).unwrap();
        assert!(kptfile.contains("name: web"));
        assert!(kptfile.contains("upstreamLock:"));
        assert!(kptfile.contains("ref: v1"));
        assert!(!fs::read_to_string(dest.join("deploy.yaml")).unwrap().contains("Recreate"));

        // Local edit that the merge must keep
        let local = fs::read_to_string(dest.join("deploy.yaml"))
            .unwrap()
            .replace("replicas: 1", "replicas: 4");
        fs::write(dest.join("deploy.yaml"), local).unwrap();

        let pkg_ref = format!("{}@v2", dest.display());
        let output = kpt(&["update", &pkg_ref, "--cache-dir", cache.to_str().unwrap()]);
        assert!(output.status.success(), "stderr: {}", stderr(&output));
        assert!(stderr(&output).contains("resource-merge"));

        let deploy = fs::read_to_string(dest.join("deploy.yaml")).unwrap();
        assert!(deploy.contains("replicas: 4"), "{}", deploy);
        assert!(deploy.contains("type: Recreate"), "{}", deploy);
        assert!(fs::read_to_string(dest.join("Kptfile")).unwrap().contains("ref: v2"));
    }

    #[test]
    fn test_get_existing_destination_fails() {
        let temp = TempDir::new().unwrap();
        let repo = upstream_repo(temp.path());
        let dest = temp.path().join("taken");
        fs::create_dir(&dest).unwrap();
        let upstream = format!("{}/nginx", repo.display());

        let output = kpt(&[
            "get",
            &upstream,
            dest.to_str().unwrap(),
            "--cache-dir",
            temp.path().join("cache").to_str().unwrap(),
        ]);

        assert_eq!(output.status.code(), Some(1));
        assert!(stderr(&output).contains("choose another destination"));
    }

    #[test]
    fn test_fast_forward_rejects_local_changes() {
        let temp = TempDir::new().unwrap();
        let repo = upstream_repo(temp.path());
        let cache = temp.path().join("cache");
        let dest = temp.path().join("web");
        let upstream = format!("{}/nginx@v1", repo.display());

        let output = kpt(&[
            "get",
            &upstream,
            dest.to_str().unwrap(),
            "--cache-dir",
            cache.to_str().unwrap(),
        ]);
        assert!(output.status.success(), "stderr: {}", stderr(&output));
        write(&dest, "extra.yaml", "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: extra\n");

        let pkg_ref = format!("{}@v2", dest.display());
        let output = kpt(&[
            "update",
            &pkg_ref,
            "--strategy",
            "fast-forward",
            "--cache-dir",
            cache.to_str().unwrap(),
        ]);

        assert_eq!(output.status.code(), Some(1));
        assert!(stderr(&output).contains("extra.yaml"));
        assert!(fs::read_to_string(dest.join("Kptfile")).unwrap().contains("ref: v1"));
    }

    #[test]
    fn test_update_without_upstream_fails() {
        let pkg = scaled_package();

        let output = kpt(&["update", pkg.path().to_str().unwrap()]);

        assert_eq!(output.status.code(), Some(1));
        assert!(stderr(&output).contains("upstream"));
    }
}

mod usage {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let output = kpt(&["--help"]);

        assert!(output.status.success());
        let out = stdout(&output);
        for command in ["render", "get", "update", "fn", "init"] {
            assert!(out.contains(command), "missing {} in {}", command, out);
        }
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let output = kpt(&["update", ".", "--strategy", "rebase"]);

        assert!(!output.status.success());
        assert!(stderr(&output).contains("rebase"));
    }
}
