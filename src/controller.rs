//! Session controller: owns the active scenario and the device backing the mode

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::config::{validate_scenario_name, Config, Mode};
use crate::hooks::Hooks;
use crate::network::{bind, serve, ConnectionPool, Listener, ServerHandle};
use crate::recording::Recorder;
use crate::replay::{History, Replayer};
use crate::{control, Result, StenoError};

/// Sink for human-readable status lines
pub type Printer = Arc<dyn Fn(&str) + Send + Sync>;

/// Printer writing status lines to stdout
#[must_use]
pub fn stdout_printer() -> Printer {
    Arc::new(|line: &str| println!("{line}"))
}

/// The recorder or replayer backing the current mode
pub enum Device {
    /// Record mode
    Recorder(Arc<Recorder>),
    /// Replay mode
    Replayer(Arc<Replayer>),
}

impl Device {
    /// Bind the device's listeners
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::PortInUse`] if a port is taken
    pub async fn start(&self) -> Result<()> {
        match self {
            Device::Recorder(recorder) => recorder.start().await,
            Device::Replayer(replayer) => replayer.start().await,
        }
    }

    /// Point the device at another scenario directory
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or loaded
    pub async fn set_storage_path(&self, path: PathBuf) -> Result<()> {
        match self {
            Device::Recorder(recorder) => recorder.set_storage_path(path).await,
            Device::Replayer(replayer) => replayer.set_storage_path(path).await,
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Recorder(_) => f.write_str("Device::Recorder"),
            Device::Replayer(_) => f.write_str("Device::Replayer"),
        }
    }
}

/// Two-state session controller
///
/// Exactly one device is built, lazily, for the configured mode. Target URLs
/// and ports are read from the configuration at that point and never again.
pub struct Controller {
    config: Config,
    hooks: Hooks,
    scenario_name: Mutex<String>,
    device: OnceCell<Device>,
    print: Printer,
}

impl Controller {
    /// Create a controller for a validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: Config, hooks: Hooks, print: Printer) -> Result<Self> {
        config.validate()?;
        debug!("Controller initialized with scenario {}", config.scenario_name);
        Ok(Self {
            scenario_name: Mutex::new(config.scenario_name.clone()),
            config,
            hooks,
            device: OnceCell::new(),
            print,
        })
    }

    /// Current mode
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.config.mode
    }

    /// Fail unless the controller is in `required` mode
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::WrongMode`] in the other mode
    pub fn require_mode(&self, required: Mode) -> Result<()> {
        if self.config.mode == required {
            Ok(())
        } else {
            Err(StenoError::WrongMode { required })
        }
    }

    /// Start the control API and the device together
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::PortInUse`] naming the conflicting listener
    pub async fn start(self: &Arc<Self>) -> Result<ServerHandle> {
        let (tcp, ()) = tokio::try_join!(
            bind(Listener::Control, self.config.control_port),
            self.start_device(),
        )?;

        let controller = Arc::clone(self);
        let server = serve(
            tcp,
            Listener::Control,
            ConnectionPool::new(self.config.limits.max_connections),
            move |req| {
                let controller = Arc::clone(&controller);
                async move { control::handle(&controller, req).await }
            },
        )?;

        self.print(&format!(
            "Control API started on port {}",
            server.local_addr().port()
        ));
        let name = self.scenario_name.lock().await.clone();
        self.print(&format!("Controller started with scenario: {name}"));
        Ok(server)
    }

    /// The device for the current mode, built on first use
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be built from the configuration
    pub async fn device(&self) -> Result<&Device> {
        self.device
            .get_or_try_init(|| async {
                let path = self.scenario_path(&self.config.scenario_name)?;
                info!("Creating {} device for {}", self.config.mode, path.display());
                Ok(match self.config.mode {
                    Mode::Record => Device::Recorder(Arc::new(Recorder::new(
                        &self.config,
                        self.hooks.clone(),
                        path,
                    )?)),
                    Mode::Replay => {
                        Device::Replayer(Arc::new(Replayer::new(&self.config, path)?))
                    }
                })
            })
            .await
    }

    async fn start_device(&self) -> Result<()> {
        self.device().await?.start().await
    }

    /// Name of the scenario being recorded
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::WrongMode`] in replay mode
    pub async fn scenario_name(&self) -> Result<String> {
        self.require_mode(Mode::Record)?;
        Ok(self.scenario_name.lock().await.clone())
    }

    /// Record into another scenario
    ///
    /// Setting the current name again does nothing.
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::WrongMode`] in replay mode, or the error from
    /// switching the recorder's directory
    pub async fn set_scenario_name(&self, name: &str) -> Result<String> {
        self.require_mode(Mode::Record)?;
        self.change_scenario(name).await
    }

    /// Replay a scenario from its beginning, even if it is already loaded
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::WrongMode`] in record mode, or the error from
    /// loading the scenario
    pub async fn start_scenario(&self, name: &str) -> Result<String> {
        self.require_mode(Mode::Replay)?;
        let name = self.change_scenario(name).await?;
        self.print(&format!("Scenario started: {name}"));
        Ok(name)
    }

    /// End the replay, returning its history and resetting the scenario
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::WrongMode`] in record mode, or the error from
    /// building the history
    pub async fn stop_scenario(&self) -> Result<History> {
        self.require_mode(Mode::Replay)?;
        let Device::Replayer(replayer) = self.device().await? else {
            return Err(StenoError::WrongMode {
                required: Mode::Replay,
            });
        };

        let history = replayer.history().await?;
        replayer.reset().await;
        let name = self.scenario_name.lock().await.clone();
        self.print(&format!("Scenario ended: {name}"));
        Ok(history)
    }

    /// Directory holding the named scenario
    ///
    /// # Errors
    ///
    /// Returns [`StenoError::InvalidScenarioName`] if the name could escape
    /// the scenario directory
    pub fn scenario_path(&self, name: &str) -> Result<PathBuf> {
        validate_scenario_name(name)?;
        Ok(self.config.scenario_dir.join(name))
    }

    async fn change_scenario(&self, name: &str) -> Result<String> {
        let mut current = self.scenario_name.lock().await;
        if self.config.mode.is_record() && *current == name {
            return Ok(current.clone());
        }

        let path = self.scenario_path(name)?;
        if let Err(e) = self.device().await?.set_storage_path(path).await {
            self.print(&format!(
                "Error changing to scenario name {name}, Scenario: {current}"
            ));
            return Err(e);
        }

        *current = name.to_string();
        self.print(&format!("Scenario: {name}"));
        Ok(current.clone())
    }

    fn print(&self, line: &str) {
        (self.print)(line);
    }
}
