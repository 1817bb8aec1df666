//! Supported emulators and their install/update/launch dispatch
//!
//! Each emulator is one variant of a closed enum carrying its metadata
//! (repository, asset filter, executable, ROM extensions). The manager wires
//! the variants to the release client, file operations, and the cache index;
//! emulator-internal setup (firmware, keys) stays out of scope.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use serde_json::json;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::cache::CacheIndex;
use crate::config::ManagerConfig;
use crate::fileops::{self, OpReport, OpStatus};
use crate::progress::ProgressHandler;
use crate::releases::{Release, ReleaseClient};

/// The emulators this manager knows how to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum EmulatorKind {
    Dolphin,
    Ryujinx,
    Yuzu,
    Xenia,
}

impl EmulatorKind {
    pub const ALL: [EmulatorKind; 4] = [
        EmulatorKind::Dolphin,
        EmulatorKind::Ryujinx,
        EmulatorKind::Yuzu,
        EmulatorKind::Xenia,
    ];

    pub fn id(self) -> &'static str {
        match self {
            EmulatorKind::Dolphin => "dolphin",
            EmulatorKind::Ryujinx => "ryujinx",
            EmulatorKind::Yuzu => "yuzu",
            EmulatorKind::Xenia => "xenia",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            EmulatorKind::Dolphin => "Dolphin",
            EmulatorKind::Ryujinx => "Ryujinx",
            EmulatorKind::Yuzu => "yuzu",
            EmulatorKind::Xenia => "Xenia",
        }
    }

    /// Console identifier used for cache keys and ROM grouping.
    pub fn console(self) -> &'static str {
        match self {
            EmulatorKind::Dolphin => "wii",
            EmulatorKind::Ryujinx | EmulatorKind::Yuzu => "switch",
            EmulatorKind::Xenia => "xbox_360",
        }
    }

    /// GitHub repository the emulator's builds are published on.
    pub fn github_repo(self) -> (&'static str, &'static str) {
        match self {
            EmulatorKind::Dolphin => ("dolphin-emu", "dolphin"),
            EmulatorKind::Ryujinx => ("Ryujinx", "release-channel-master"),
            EmulatorKind::Yuzu => ("yuzu-emu", "yuzu-mainline"),
            EmulatorKind::Xenia => ("xenia-project", "release-builds-windows"),
        }
    }

    /// Substring picking the right release asset for this platform.
    pub fn asset_filter(self) -> &'static str {
        match self {
            EmulatorKind::Dolphin => "linux",
            EmulatorKind::Ryujinx => "linux_x64",
            EmulatorKind::Yuzu => "AppImage",
            EmulatorKind::Xenia => "master.zip",
        }
    }

    /// Name of the main executable inside the install directory.
    pub fn executable(self) -> &'static str {
        match self {
            EmulatorKind::Dolphin => "dolphin-emu",
            EmulatorKind::Ryujinx => "Ryujinx",
            EmulatorKind::Yuzu => "yuzu",
            EmulatorKind::Xenia => "xenia",
        }
    }

    /// ROM file extensions (lowercase) for this emulator's console.
    pub fn rom_extensions(self) -> &'static [&'static str] {
        match self {
            EmulatorKind::Dolphin => &["iso", "rvz", "wbfs", "gcm", "gcz"],
            EmulatorKind::Ryujinx | EmulatorKind::Yuzu => &["nsp", "xci"],
            EmulatorKind::Xenia => &["iso", "xex"],
        }
    }

    /// Cache key for the persisted game listing, e.g. `switch_games`.
    pub fn games_cache_key(self) -> String {
        format!("{}_games", self.console())
    }

    /// Cache key recording the installed release tag.
    pub fn version_cache_key(self) -> String {
        format!("{}_version", self.id())
    }
}

/// Orchestrates emulator installs, updates, launches, and ROM scans.
pub struct EmulatorManager {
    config: ManagerConfig,
    cache: CacheIndex,
    client: ReleaseClient,
}

impl EmulatorManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let cache = CacheIndex::new(&config.cache_dir)?;
        let client = ReleaseClient::new()?;
        Ok(Self {
            config,
            cache,
            client,
        })
    }

    pub fn install_dir(&self, kind: EmulatorKind) -> PathBuf {
        self.config.install_root.join(kind.id())
    }

    /// Release tag recorded by the last successful install, if any.
    pub fn installed_version(&self, kind: EmulatorKind) -> Option<String> {
        let (value, _) = self.cache.get_json(&kind.version_cache_key())?;
        value["tag"].as_str().map(|s| s.to_string())
    }

    /// Download and install the latest release of `kind`, reporting progress
    /// (download bytes, then archive entries) through `progress`.
    pub fn install(&self, kind: EmulatorKind, progress: &ProgressHandler) -> Result<OpReport> {
        let (owner, repo) = kind.github_repo();
        let release = self.client.latest_release(owner, repo)?;
        self.install_release(kind, &release, progress)
    }

    /// Reinstall only when the latest release tag differs from the recorded
    /// one.
    pub fn update(&self, kind: EmulatorKind, progress: &ProgressHandler) -> Result<OpReport> {
        let (owner, repo) = kind.github_repo();
        let release = self.client.latest_release(owner, repo)?;
        if self.installed_version(kind).as_deref() == Some(release.tag_name.as_str()) {
            info!("{} already at {}", kind.display_name(), release.tag_name);
            return Ok(OpReport {
                status: OpStatus::Completed,
                message: format!("{} is already up to date", kind.display_name()),
                processed: 0,
            });
        }
        self.install_release(kind, &release, progress)
    }

    fn install_release(
        &self,
        kind: EmulatorKind,
        release: &Release,
        progress: &ProgressHandler,
    ) -> Result<OpReport> {
        let asset = release
            .find_asset(kind.asset_filter())
            .with_context(|| {
                format!(
                    "release {} of {} has no asset matching '{}'",
                    release.tag_name,
                    kind.display_name(),
                    kind.asset_filter()
                )
            })?
            .clone();

        let staging = self.config.cache_dir.join("downloads");
        fs::create_dir_all(&staging)?;
        let download_path = staging.join(&asset.name);

        info!(
            "installing {} {} ({})",
            kind.display_name(),
            release.tag_name,
            asset.name
        );
        let report = self.client.download_asset(&asset, &download_path, progress);
        if !report.succeeded() {
            return Ok(report);
        }

        let install_dir = self.install_dir(kind);
        fs::create_dir_all(&install_dir)?;

        let report = if asset.name.ends_with(".zip") {
            fileops::extract_archive_with_progress(&download_path, &install_dir, progress)
        } else {
            // Single-file builds (AppImages) are moved in as the executable.
            self.place_single_file(kind, &download_path, &install_dir)?
        };
        if !report.succeeded() {
            return Ok(report);
        }

        self.cache
            .put_json(&kind.version_cache_key(), &json!({ "tag": release.tag_name }))?;
        info!("{} {} installed", kind.display_name(), release.tag_name);
        Ok(OpReport {
            status: OpStatus::Completed,
            message: format!("{} {} installed", kind.display_name(), release.tag_name),
            processed: report.processed,
        })
    }

    fn place_single_file(
        &self,
        kind: EmulatorKind,
        downloaded: &Path,
        install_dir: &Path,
    ) -> Result<OpReport> {
        let dest = install_dir.join(kind.executable());
        fs::rename(downloaded, &dest).or_else(|_| {
            fs::copy(downloaded, &dest)?;
            fs::remove_file(downloaded)
        })?;
        make_executable(&dest)?;
        Ok(OpReport {
            status: OpStatus::Completed,
            message: format!("placed {}", dest.display()),
            processed: 1,
        })
    }

    /// Launch the emulator, optionally with a ROM to boot.
    pub fn launch(&self, kind: EmulatorKind, rom: Option<&Path>) -> Result<()> {
        let exe = find_executable(&self.install_dir(kind), kind.executable())
            .with_context(|| format!("{} is not installed", kind.display_name()))?;
        let mut command = Command::new(&exe);
        if let Some(rom) = rom {
            command.arg(rom);
        }
        debug!("launching {:?}", command);
        command
            .spawn()
            .with_context(|| format!("failed to launch {}", exe.display()))?;
        Ok(())
    }

    /// Enumerate ROMs for `kind` under the configured ROM directory and
    /// persist the listing under the `<console>_games` cache key.
    pub fn scan_games(&self, kind: EmulatorKind) -> Result<Vec<PathBuf>> {
        let rom_dir = self.config.rom_dir()?;
        let extensions = kind.rom_extensions();
        let mut games: Vec<PathBuf> = WalkDir::new(rom_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| extensions.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .map(|e| e.path().to_path_buf())
            .collect();
        games.sort();

        let listing: Vec<String> = games.iter().map(|p| p.display().to_string()).collect();
        self.cache.put_json(&kind.games_cache_key(), &listing)?;
        info!("found {} {} games", games.len(), kind.console());
        Ok(games)
    }

    /// Previously scanned game listing with its scan timestamp, if cached.
    pub fn cached_games(&self, kind: EmulatorKind) -> Option<(Vec<String>, f64)> {
        let (value, time) = self.cache.get_json(&kind.games_cache_key())?;
        let games = value
            .as_array()?
            .iter()
            .filter_map(|v| v.as_str().map(|s| s.to_string()))
            .collect();
        Some((games, time))
    }

    pub fn cache(&self) -> &CacheIndex {
        &self.cache
    }
}

/// The executable may sit at the top level or one directory down inside an
/// extracted build.
fn find_executable(install_dir: &Path, name: &str) -> Option<PathBuf> {
    WalkDir::new(install_dir)
        .max_depth(3)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.file_type().is_file() && e.file_name() == name)
        .map(|e| e.path().to_path_buf())
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms)?;
    Ok(())
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
