use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use anyhow::Result;
use chrono::TimeDelta;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use tempfile::TempDir;
use getrel::*;

const API: &str = "https://api.test";
const RELEASE_URL: &str = "https://api.test/repos/owner/tool/releases/latest";
const ASSET_URL: &str = "https://api.test/repos/owner/tool/releases/assets/1";
const ASSET_NAME: &str = "tool-1.0.0-linux.tar.gz";

/// Serves fixed bodies per URL, 404 for everything else.
#[derive(Default)]
struct FakeGitHub {
    routes: Mutex<HashMap<String, Vec<u8>>>,
    requests: Mutex<Vec<String>>,
}

impl FakeGitHub {
    fn serve(&self, url: &str, body: Vec<u8>) {
        self.routes.lock().unwrap().insert(url.to_string(), body);
    }

    fn requests_for(&self, url: &str) -> usize {
        self.requests.lock().unwrap().iter().filter(|u| *u == url).count()
    }
}

impl HttpClient for FakeGitHub {
    fn get(&self, url: &str, _headers: &[(String, String)]) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(url.to_string());
        let (status, body) = match self.routes.lock().unwrap().get(url) {
            Some(body) => (200, body.clone()),
            None => (404, b"Not Found".to_vec()),
        };
        let headers = HashMap::from([("etag".to_string(), format!("\"{}\"", body.len()))]);
        Ok(HttpResponse { status, headers, body: Box::new(std::io::Cursor::new(body)) })
    }
}

struct Setup {
    _dir: TempDir,
    root: PathBuf,
    layout: Layout,
    github: Arc<FakeGitHub>,
}

fn release_record(tag: &str, asset_name: &str, asset_url: &str) -> Vec<u8> {
    json!({
        "tag_name": tag,
        "published_at": "2024-05-01T12:00:00Z",
        "created_at": "2024-05-01T11:00:00Z",
        "draft": false,
        "prerelease": false,
        "assets": [
            {"name": asset_name, "label": "", "size": 1234, "download_count": 3, "url": asset_url}
        ]
    })
    .to_string()
    .into_bytes()
}

fn tarball(members: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in members {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn setup_tests() -> Setup {
    let dir = TempDir::new().unwrap();
    let root = dir.path().canonicalize().unwrap();
    let layout = Layout {
        data_dir: root.join("data"),
        bin_dir: root.join("bin"),
        api_url: API.to_string(),
    };
    let github = Arc::new(FakeGitHub::default());
    github.serve(RELEASE_URL, release_record("v1.0.0", ASSET_NAME, ASSET_URL));
    github.serve(ASSET_URL, tarball(&[("tool-1.0.0/bin/tool", b"#!/bin/sh\necho tool\n")]));
    Setup { _dir: dir, root, layout, github }
}

fn tool_config() -> ProjectConfig {
    let mut config = ProjectConfig::new("https://github.com/owner/tool");
    config.assets.insert("*.tar.gz", ActionSpec::bare(Action::Unpack));
    config.install.insert("*/bin/tool", ActionSpec::bare(Action::Bin));
    config
}

impl Setup {
    fn fetcher(&self, fetch_delay: TimeDelta) -> Fetcher {
        Fetcher::new(self.github.clone(), fetch_delay, TimeDelta::zero())
    }

    fn open(&self, config: ProjectConfig) -> Project {
        Project::open("tool", config, &self.layout, self.fetcher(TimeDelta::zero())).unwrap()
    }

    fn link(&self) -> PathBuf {
        self.root.join("bin").join("tool")
    }
}

fn registry(project: &Project) -> Vec<String> {
    project.state.installed_files.list().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_install_unpacks_and_links() {
        let setup = setup_tests();
        let mut project = setup.open(tool_config());
        project.install(false).unwrap();

        let directory = project.directory().to_path_buf();
        let binary = directory.join("tool-1.0.0/bin/tool");
        assert!(directory.join(ASSET_NAME).is_file());
        assert!(binary.is_file());
        assert_eq!(fs::read_link(setup.link()).unwrap(), binary);
        #[cfg(unix)]
        assert!(getrel::util::is_executable(&binary));

        assert_eq!(
            registry(&project),
            [
                ASSET_NAME.to_string(),
                "tool-1.0.0/bin/tool".to_string(),
                setup.link().display().to_string()
            ]
        );
        assert_eq!(project.state.installed.as_ref().map(|i| i.version.as_str()), Some("v1.0.0"));
        assert_eq!(project.state.candidate.as_deref(), Some("v1.0.0"));
    }

    #[test]
    fn test_state_survives_reopening() {
        let setup = setup_tests();
        let mut project = setup.open(tool_config());
        project.install(false).unwrap();
        let expected = registry(&project);

        let reopened = setup.open(tool_config());
        assert_eq!(registry(&reopened), expected);
        assert_eq!(reopened.releases().unwrap().len(), 1);
        assert!(!reopened.needs_download(&reopened.get_assets().unwrap()[0]));
    }

    #[test]
    fn test_uninstall_removes_everything_and_is_repeatable() {
        let setup = setup_tests();
        let mut project = setup.open(tool_config());
        project.install(false).unwrap();
        fs::write(project.directory().join("stray.txt"), "not registered").unwrap();

        project.uninstall(false).unwrap();
        let directory = project.directory().to_path_buf();
        assert!(registry(&project).is_empty());
        assert!(project.state.installed.is_none());
        assert!(fs::symlink_metadata(setup.link()).is_err());
        assert!(!directory.join("tool-1.0.0").exists());
        assert!(!directory.join(ASSET_NAME).exists());
        assert!(!directory.join("stray.txt").exists());
        assert!(directory.join(".getrel").is_dir());

        project.uninstall(false).unwrap();
        assert!(registry(&project).is_empty());
    }

    #[test]
    fn test_uninstall_keeping_assets() {
        let setup = setup_tests();
        let mut project = setup.open(tool_config());
        project.install(false).unwrap();

        project.uninstall(true).unwrap();
        assert_eq!(registry(&project), [ASSET_NAME]);
        assert!(project.directory().join(ASSET_NAME).is_file());
        assert!(!project.directory().join("tool-1.0.0").exists());
    }

    #[test]
    fn test_update_reports_new_release() {
        let setup = setup_tests();
        let mut project = setup.open(tool_config());
        project.install(false).unwrap();
        assert!(!project.update().unwrap());

        setup.github.serve(
            RELEASE_URL,
            release_record("v1.1.0", "tool-1.1.0-linux.tar.gz", "https://api.test/assets/2"),
        );
        assert!(project.update().unwrap());
        assert_eq!(project.state.candidate.as_deref(), Some("v1.1.0"));
        assert_eq!(project.state.installed.as_ref().map(|i| i.version.as_str()), Some("v1.0.0"));
    }

    #[test]
    fn test_update_is_throttled() {
        let setup = setup_tests();
        let fetcher = setup.fetcher(TimeDelta::hours(1));
        let mut project = Project::open("tool", tool_config(), &setup.layout, fetcher).unwrap();

        project.update().unwrap();
        assert!(!project.update().unwrap());
        assert_eq!(setup.github.requests_for(RELEASE_URL), 1);
    }

    #[test]
    fn test_missing_download_is_fetched_again() {
        let setup = setup_tests();
        let fetcher = setup.fetcher(TimeDelta::hours(1));
        let mut project = Project::open("tool", tool_config(), &setup.layout, fetcher).unwrap();
        project.install(false).unwrap();
        assert!(!project.download().unwrap());

        fs::remove_file(project.directory().join(ASSET_NAME)).unwrap();
        assert!(project.download().unwrap());
        assert_eq!(setup.github.requests_for(ASSET_URL), 2);
        assert!(project.directory().join(ASSET_NAME).is_file());
    }

    #[test]
    fn test_failed_download_does_not_install_anything() {
        let setup = setup_tests();
        setup.github.routes.lock().unwrap().remove(ASSET_URL);
        let mut project = setup.open(tool_config());

        project.install(false).unwrap();
        assert!(registry(&project).is_empty());
        assert!(fs::symlink_metadata(setup.link()).is_err());
    }

    #[test]
    fn test_no_matching_release_fails_install() {
        let setup = setup_tests();
        let mut config = tool_config();
        config.release = "v9.*".to_string();
        setup.github.serve(
            "https://api.test/repos/owner/tool/releases",
            format!(
                "[{}]",
                String::from_utf8(release_record("v1.0.0", ASSET_NAME, ASSET_URL)).unwrap()
            )
            .into_bytes(),
        );
        let mut project = setup.open(config);

        assert!(project.install(false).is_err());
        assert!(project.state.installed.is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_postinstall_files_are_registered() {
        let setup = setup_tests();
        let mut config = tool_config();
        config.postinstall = Some("./tool-1.0.0/bin/tool > version.txt".to_string());
        let mut project = setup.open(config);
        project.install(false).unwrap();

        let directory = project.directory();
        assert_eq!(fs::read_to_string(directory.join("version.txt")).unwrap(), "tool\n");
        assert!(registry(&project).contains(&"version.txt".to_string()));

        project.uninstall(false).unwrap();
        assert!(!project.directory().join("version.txt").exists());
    }

    #[test]
    fn test_get_installed_classifies_files() {
        let setup = setup_tests();
        let mut project = setup.open(tool_config());
        project.install(false).unwrap();
        fs::write(project.directory().join("notes.txt"), "mine").unwrap();

        let files = project.get_installed().unwrap();
        let find = |relative: &str| files.iter().find(|f| f.relative == relative).unwrap();
        assert!(find(ASSET_NAME).asset.is_some());
        assert_eq!(find("tool-1.0.0/bin/tool").install_spec, Some(ActionSpec::bare(Action::Bin)));
        assert!(find(&setup.link().display().to_string()).external);
        assert!(find("notes.txt").unregistered);
    }

    #[test]
    fn test_delete_only_touches_project_files() {
        let setup = setup_tests();
        let project_dir = setup.root.join("data").join("tool");
        let elsewhere = setup.root.join("elsewhere");
        fs::create_dir_all(&project_dir).unwrap();
        fs::create_dir_all(&elsewhere).unwrap();
        fs::write(project_dir.join("build.log"), "log").unwrap();
        fs::write(project_dir.join("keep.txt"), "keep").unwrap();
        fs::write(elsewhere.join("build.log"), "not ours").unwrap();

        let mut installed = InstalledFiles::default();
        installed
            .register(&project_dir, [project_dir.join("build.log"), project_dir.join("keep.txt")]);
        let rules = RuleTable::new();
        let mut installer =
            Installer::new("tool", &project_dir, &setup.layout.bin_dir, &rules, &mut installed);

        let spec = ActionSpec::with_arg(Action::Delete, "*.log");
        installer.run(&spec, &project_dir).unwrap();
        let outside = format!("{}/*.log", elsewhere.display());
        installer.run(&ActionSpec::with_arg(Action::Delete, &outside), &project_dir).unwrap();

        assert!(!project_dir.join("build.log").exists());
        assert!(elsewhere.join("build.log").exists());
        assert_eq!(installed.list(), ["keep.txt"]);
    }

    #[test]
    fn test_suggested_patterns() {
        let setup = setup_tests();
        let mut project = setup.open(tool_config());
        project.update().unwrap();

        assert_eq!(project.suggest_release_pattern("v1.0.0").unwrap(), "v*");
        assert_eq!(project.suggest_asset_pattern(ASSET_NAME).unwrap(), "tool-*-linux.tar.gz");
    }
}
