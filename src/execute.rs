use std::str::FromStr;
use std::sync::Arc;
use anyhow::{bail, Context, Result};
use colored::Colorize;
use tracing::error;
use getrel::config::{github_url, parse_github_url, ActionSpec, ProjectConfig, ProjectsFile};
use getrel::fetch::{Fetcher, ReqwestClient};
use getrel::global::settings::{Layout, Settings};
use getrel::global::utils::{get_projects_file, get_settings_file};
use getrel::pattern::identifying_pattern;
use getrel::project::Project;
use getrel::util::human_size;
use crate::cli::{GetrelCommand, CLI};

pub fn execute(cli: CLI) -> Result<()> {
    match cli.command {
        GetrelCommand::Pattern { selection, alternatives, version } => {
            execute_pattern(&selection, &alternatives, version.as_deref())
        }
        GetrelCommand::Add { url, name, release, assets, replace, install, postinstall } => {
            let rules =
                AddRules { assets: &assets, replace: replace.as_deref(), install: &install };
            execute_add(&url, name.as_deref(), release, rules, postinstall)
        }
        GetrelCommand::Remove { name } => {
            execute_remove(&name)
        }
        GetrelCommand::List { verbose } => {
            execute_list(verbose)
        }
        GetrelCommand::Update { names } => {
            Environment::load()?.for_each(&names, |project| {
                project.update()?;
                Ok(())
            })
        }
        GetrelCommand::Download { names } => {
            Environment::load()?.for_each(&names, |project| {
                project.download()?;
                Ok(())
            })
        }
        GetrelCommand::Install { names, force } => {
            Environment::load()?.for_each(&names, |project| project.install(force))
        }
        GetrelCommand::Uninstall { names, keep_assets } => {
            Environment::load()?.for_each(&names, |project| project.uninstall(keep_assets))
        }
        GetrelCommand::Files { name } => {
            execute_files(&name)
        }
        GetrelCommand::Suggest { name } => {
            execute_suggest(&name)
        }
    }
}

/// Everything a command needs to open projects.
struct Environment {
    projects: ProjectsFile,
    layout: Layout,
    fetcher: Fetcher,
}

impl Environment {
    fn load() -> Result<Self> {
        let settings = Settings::load_or_default(get_settings_file()?)?;
        let layout = settings.layout()?;
        let client = ReqwestClient::new()?;
        let fetcher =
            Fetcher::new(Arc::new(client), settings.fetch_delay()?, settings.update_delay()?);
        let projects = ProjectsFile::load_or_default(get_projects_file()?)?;
        Ok(Self { projects, layout, fetcher })
    }

    fn open(&self, name: &str) -> Result<Project> {
        let Some(config) = self.projects.get(name) else {
            bail!("Project {name} does not exist. Add it with `getrel add`");
        };
        Project::open(name, config.clone(), &self.layout, self.fetcher.clone())
    }

    /// The named projects, or all of them.
    fn selected(&self, names: &[String]) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(self.projects.projects.keys().cloned().collect());
        }
        for name in names {
            if self.projects.get(name).is_none() {
                bail!("Project {name} does not exist. Add it with `getrel add`");
            }
        }
        Ok(names.to_vec())
    }

    /// Runs `operation` on each selected project. A failing project does not stop the others.
    fn for_each<F>(&self, names: &[String], mut operation: F) -> Result<()>
    where
        F: FnMut(&mut Project) -> Result<()>,
    {
        let names = self.selected(names)?;
        let mut failed = Vec::new();
        for name in &names {
            let result = self.open(name).and_then(|mut project| operation(&mut project));
            if let Err(e) = result {
                error!("{name}: {e:#}");
                failed.push(name.as_str());
            }
        }
        if !failed.is_empty() {
            bail!("{} of {} projects failed: {}", failed.len(), names.len(), failed.join(", "));
        }
        Ok(())
    }
}

/// Splits `PATTERN=SPEC`; the spec is optional.
fn parse_rule(rule: &str) -> Result<(String, Option<ActionSpec>)> {
    match rule.split_once('=') {
        Some((pattern, spec)) => Ok((pattern.to_string(), Some(ActionSpec::from_str(spec)?))),
        None => Ok((rule.to_string(), None)),
    }
}

/// Rule options of `getrel add`.
pub struct AddRules<'a> {
    pub assets: &'a [String],
    pub replace: Option<&'a str>,
    pub install: &'a [String],
}

pub fn execute_add(
    url: &str,
    name: Option<&str>,
    release: Option<String>,
    rules: AddRules<'_>,
    postinstall: Option<String>,
) -> Result<()> {
    let projects_path = get_projects_file()?;
    let mut projects = ProjectsFile::load_or_default(&projects_path)?;

    let (user, repo) = parse_github_url(url)?;
    let name = name.unwrap_or(&repo).to_string();
    let mut config = match projects.get(&name) {
        Some(existing) if existing.url == github_url(&user, &repo) => existing.clone(),
        _ => ProjectConfig::new(url),
    };
    if let Some(release) = release {
        config.release = release;
    }
    if postinstall.is_some() {
        config.postinstall = postinstall;
    }
    for (index, rule) in rules.assets.iter().enumerate() {
        let (pattern, spec) = parse_rule(rule)?;
        let previous = if index == 0 { rules.replace } else { None };
        config
            .configure_asset(previous, Some(&pattern), spec)
            .with_context(|| format!("Invalid asset rule {rule}"))?;
    }
    for rule in rules.install {
        let (pattern, spec) = parse_rule(rule)?;
        let spec = spec
            .with_context(|| format!("Install rule {rule} is not of the form PATTERN=SPEC"))?;
        config.install.insert(&pattern, spec);
    }

    let has_assets = !config.assets.is_empty();
    let name = projects.add(Some(&name), config)?;
    projects.save(&projects_path)?;
    println!("Configured {}", name.bold());
    if !has_assets {
        println!(
            "No assets configured yet. Run `getrel update {name}` and `getrel suggest {name}` to pick some."
        );
    }
    Ok(())
}

pub fn execute_remove(name: &str) -> Result<()> {
    let projects_path = get_projects_file()?;
    let mut projects = ProjectsFile::load_or_default(&projects_path)?;
    if projects.remove(name).is_none() {
        bail!("Project {name} does not exist");
    }
    projects.save(&projects_path)?;
    println!("Removed {name}. Its project directory is left alone");
    Ok(())
}

pub fn execute_list(verbose: bool) -> Result<()> {
    let env = Environment::load()?;
    if env.projects.projects.is_empty() {
        println!("No projects");
        return Ok(());
    }

    for (name, config) in &env.projects.projects {
        let project = match env.open(name) {
            Ok(project) => project,
            Err(e) => {
                println!("{}: {}", name.red(), e);
                continue;
            }
        };
        let installed = match &project.state.installed {
            Some(installed) => installed.version.green().to_string(),
            None => "not installed".yellow().to_string(),
        };
        println!("{} ({}): {}", name.bold(), config.url, installed);
        if !verbose {
            continue;
        }
        println!("    release: {}", config.release);
        if let Some(candidate) = &project.state.candidate {
            println!("    candidate: {candidate}");
        }
        if let Some(updated) = &project.state.updated {
            println!("    updated: {}", updated.format("%Y-%m-%d %H:%M"));
        }
        for (pattern, spec) in config.assets.iter() {
            println!("    asset {pattern} = {spec}");
        }
        for (pattern, spec) in config.install.iter() {
            println!("    install {pattern} = {spec}");
        }
        if config.postinstall.is_some() {
            println!("    postinstall script");
        }
    }
    Ok(())
}

pub fn execute_files(name: &str) -> Result<()> {
    let env = Environment::load()?;
    let project = env.open(name)?;
    for file in project.get_installed()? {
        let line = match &file.install_spec {
            Some(spec) => format!("{file} ({spec})"),
            None => file.to_string(),
        };
        if file.unregistered {
            println!("{} {}", line.yellow(), "(unregistered)".dimmed());
        } else if file.external {
            println!("{}", line.cyan());
        } else if file.boring {
            println!("{}", line.dimmed());
        } else {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn execute_suggest(name: &str) -> Result<()> {
    let env = Environment::load()?;
    let mut project = env.open(name)?;
    if project.state.updated.is_none() {
        project.update()?;
    }
    let Some(release) = project.select_release()? else {
        bail!("No release matching {} found for {name}", project.config.release);
    };
    println!("{} {}", "release".bold(), project.suggest_release_pattern(&release.version)?);
    for (descriptor, asset) in project.all_assets()? {
        let size = human_size(descriptor.size);
        match asset {
            Some(asset) => println!("{} {} [{size}] -> {}", "*".green(), asset.pattern, asset.spec),
            None => {
                let suggestion = project.suggest_asset_pattern(&descriptor.name)?;
                println!("  {suggestion} [{size}] {}", descriptor.to_string().dimmed());
            }
        }
    }
    Ok(())
}

pub fn execute_pattern(
    selection: &str,
    alternatives: &[String],
    version: Option<&str>,
) -> Result<()> {
    let pattern = identifying_pattern(selection, alternatives, version)?;
    println!("{pattern}");
    Ok(())
}
