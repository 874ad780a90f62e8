use clap::{Parser, Subcommand};

#[derive(Debug, Parser, Clone)]
#[clap(author, version, about, long_about = None)]
pub struct CLI {
    /// Show debug output
    #[clap(short, long)]
    pub verbose: bool,
    #[command(subcommand)]
    pub(crate) command: GetrelCommand,
}

#[derive(Debug, Subcommand, Clone, PartialEq)]
pub enum GetrelCommand {
    /// Adds a project to `projects.toml` or reconfigures it. Nothing is downloaded!
    ///
    /// Options given for an existing project are merged into its configuration.
    Add {
        /// GitHub URL of the project, or `user/repo`
        url: String,
        /// Name of the project. Defaults to the repository name
        #[clap(long)]
        name: Option<String>,
        /// `latest`, `pre` or a glob pattern for release tags
        #[clap(long)]
        release: Option<String>,
        /// Asset rule: <pattern>=<action>[:<arg>][,<action>...]. The spec may be left out
        /// when reconfiguring a rule with --replace
        #[clap(long = "asset", value_name = "PATTERN[=SPEC]")]
        assets: Vec<String>,
        /// Asset rule pattern that the first --asset replaces in place
        #[clap(long, value_name = "OLD_PATTERN", requires = "assets")]
        replace: Option<String>,
        /// Install rule for files produced by the asset actions, same syntax as --asset
        #[clap(long = "install", value_name = "PATTERN=SPEC")]
        install: Vec<String>,
        /// Script run in the project directory after installation
        #[clap(long)]
        postinstall: Option<String>,
    },
    /// Removes a project from `projects.toml`. Uninstall it first!
    Remove {
        name: String,
    },
    /// Fetches release metadata. Defaults to all projects
    Update {
        names: Vec<String>,
    },
    /// Downloads the configured assets of the selected release. Defaults to all projects
    Download {
        names: Vec<String>,
    },
    /// Downloads and installs projects. Defaults to all projects
    Install {
        names: Vec<String>,
        /// Run the install actions even if nothing changed
        #[clap(long)]
        force: bool,
    },
    /// Removes every file installed for the projects. Defaults to all projects
    Uninstall {
        names: Vec<String>,
        /// Keep the downloaded assets
        #[clap(long)]
        keep_assets: bool,
    },
    /// List all projects in `projects.toml`
    List {
        /// Also show rules and the release candidate
        #[clap(short, long)]
        verbose: bool,
    },
    /// List the files belonging to a project
    Files {
        name: String,
    },
    /// Show the assets of the selected release with suggested patterns
    Suggest {
        name: String,
    },
    /// Print a glob pattern that matches SELECTION but none of the ALTERNATIVES
    Pattern {
        selection: String,
        alternatives: Vec<String>,
        /// Version to mask in SELECTION
        #[clap(long)]
        version: Option<String>,
    },
}
