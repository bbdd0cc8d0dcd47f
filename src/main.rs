// Copyright 2025 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use clap::{Parser, Subcommand};
use nopa::command;

#[derive(Parser)]
#[command(author, version, about, long_about)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Installs dependencies declared in package.json
    #[clap(alias = "i")]
    Install {
        /// Skip devDependencies and prune their closure from the tree
        #[clap(long)]
        production: bool,
        /// Install into the global installation root
        #[clap(long, short = 'g')]
        global: bool,
        /// Install a single package instead of the project manifest
        package: Option<String>,
        /// Never run lifecycle scripts
        #[clap(long)]
        ignore_scripts: bool,
    },

    /// Adds a dependency to the manifest and installs it
    Add {
        /// Package to add (format: <name>[@<version-or-range>])
        package: String,
        /// Never run lifecycle scripts
        #[clap(long)]
        ignore_scripts: bool,
    },

    /// Removes a dependency and its orphaned transitive closure
    #[clap(alias = "rm")]
    Remove {
        /// Package to remove from the dependencies
        package: String,
    },

    /// Uninstalls a package, locally or globally
    Uninstall {
        /// Remove from the global installation instead of the project
        #[clap(long, short = 'g')]
        global: bool,
        /// Package to uninstall
        package: String,
    },

    /// Lists the installed package tree
    #[clap(alias = "ls")]
    List {
        /// Include transitive dependencies
        #[clap(long)]
        all: bool,
    },

    /// Runs a script declared in package.json
    Run {
        /// Script name
        script: String,
    },

    /// Shows registry metadata for a package
    Info {
        /// Package to inspect (format: <name>[@<version-or-range>])
        package: String,
    },

    /// Cache maintenance
    #[clap(subcommand)]
    Cache(CacheCommand),
}

#[derive(Subcommand)]
enum CacheCommand {
    /// Clears cached manifests, archives and extracted packages
    Rm,
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    human_panic::setup_panic!();

    tracing_subscriber::fmt()
        .compact()
        .without_time()
        .with_level(false)
        .with_file(false)
        .with_target(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .try_init()
        .unwrap();

    let cli = Cli::parse();

    match cli.command {
        Command::Install {
            production,
            global,
            package,
            ignore_scripts,
        } => command::install(production, global, package, ignore_scripts).await,
        Command::Add {
            package,
            ignore_scripts,
        } => command::add(package, ignore_scripts).await,
        Command::Remove { package } => command::remove(package).await,
        Command::Uninstall { global, package } => command::uninstall(package, global).await,
        Command::List { all } => command::list(all).await,
        Command::Run { script } => command::run_script(script).await,
        Command::Info { package } => command::info(package).await,
        Command::Cache(CacheCommand::Rm) => command::cache_rm().await,
    }
}
