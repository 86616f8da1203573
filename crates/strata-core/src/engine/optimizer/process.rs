use super::ipi::companion_main;
use super::{
    AtomPartition, LaunchRequest, OptimizerEndpoint, OptimizerHandle, OptimizerLauncher,
    SENTINEL_FILE,
};
use crate::core::io::xyz::{XyzFile, XyzFrame};
use crate::core::models::optimisation::{OptimisationSettings, SocketAddress};
use crate::core::models::system::Molecule;
use crate::engine::error::EngineError;
use std::fmt::Write as _;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument};

pub const INPUT_FILE: &str = "input.xml";
pub const INIT_FILE: &str = "init.xyz";
pub const LOG_FILE: &str = "optimizer.log";

const CONNECT_RETRY: Duration = Duration::from_millis(100);

/// Socket connection to a running i-PI server.
pub enum IpiStream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl IpiStream {
    pub fn try_clone(&self) -> io::Result<Self> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.try_clone().map(Self::Unix),
            Self::Tcp(s) => s.try_clone().map(Self::Tcp),
        }
    }

    pub fn shutdown(&self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.shutdown(Shutdown::Both),
            Self::Tcp(s) => s.shutdown(Shutdown::Both),
        }
    }

    fn connect(address: &SocketAddress) -> io::Result<Self> {
        match address {
            #[cfg(unix)]
            SocketAddress::Unix { name } => UnixStream::connect(unix_socket_path(name)).map(Self::Unix),
            #[cfg(not(unix))]
            SocketAddress::Unix { .. } => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "unix sockets are not available on this platform",
            )),
            SocketAddress::Inet { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port))?;
                stream.set_nodelay(true)?;
                Ok(Self::Tcp(stream))
            }
        }
    }
}

impl Read for IpiStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.read(buf),
            Self::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for IpiStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.write(buf),
            Self::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(s) => s.flush(),
            Self::Tcp(s) => s.flush(),
        }
    }
}

/// Path of the Unix domain socket i-PI creates for an `ffsocket` address.
pub fn unix_socket_path(name: &str) -> PathBuf {
    PathBuf::from(format!("/tmp/ipi_{}", name))
}

/// Starts one i-PI process per slice.
///
/// Each slice runs in `work_dir/slice_<depth>` with its own socket address. The launcher
/// writes the initial geometry and a minimal minimisation input, starts the executable,
/// connects to it and hands the connection to a companion thread.
#[derive(Debug, Clone)]
pub struct IpiLauncher {
    grace: Duration,
}

impl Default for IpiLauncher {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(5),
        }
    }
}

impl IpiLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// How long a stopped optimiser may take to exit before it is killed.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }
}

impl OptimizerLauncher for IpiLauncher {
    #[instrument(skip_all, name = "ipi_launch", fields(depth = request.depth))]
    fn launch(&self, request: LaunchRequest<'_>) -> Result<OptimizerHandle, EngineError> {
        let LaunchRequest {
            depth,
            settings,
            molecule,
            partition,
        } = request;

        let work_dir = slice_dir(settings, depth);
        fs::create_dir_all(&work_dir)
            .map_err(|e| EngineError::io(format!("creating {}", work_dir.display()), e))?;
        let sentinel = work_dir.join(SENTINEL_FILE);
        if sentinel.exists() {
            fs::remove_file(&sentinel)
                .map_err(|e| EngineError::io("removing stale sentinel", e))?;
        }

        let address = settings.socket.for_slice(depth);
        write_initial_geometry(molecule, &partition, &work_dir.join(INIT_FILE))?;
        let input = ipi_input(settings, &address, &partition, depth);
        fs::write(work_dir.join(INPUT_FILE), input)
            .map_err(|e| EngineError::io("writing optimiser input", e))?;

        let child = spawn_optimizer(settings, &work_dir)?;
        info!(
            depth,
            address = %address,
            pid = child.id(),
            "Optimiser started."
        );

        let endpoint = Arc::new(OptimizerEndpoint::new(depth, work_dir, partition));
        let mut handle = OptimizerHandle::new(Arc::clone(&endpoint))
            .with_process(child)
            .with_grace(self.grace);

        let stream = match connect(&address, settings.connect_timeout, &mut handle) {
            Ok(stream) => stream,
            Err(e) => {
                handle.teardown()?;
                return Err(e);
            }
        };
        let canceller = stream
            .try_clone()
            .map_err(|e| EngineError::io("cloning optimiser socket", e))?;
        handle = handle.with_cancel(move || {
            let _ = canceller.shutdown();
        });

        let companion = thread::Builder::new()
            .name(format!("ipi-companion-{}", depth))
            .spawn(move || companion_main(stream, &endpoint))
            .map_err(|e| EngineError::io("starting optimiser companion", e))?;
        debug!(depth, "Companion connected.");

        Ok(handle.with_companion(companion))
    }
}

fn slice_dir(settings: &OptimisationSettings, depth: usize) -> PathBuf {
    settings.work_dir.join(format!("slice_{}", depth))
}

fn spawn_optimizer(settings: &OptimisationSettings, work_dir: &Path) -> Result<Child, EngineError> {
    let log = File::create(work_dir.join(LOG_FILE))
        .map_err(|e| EngineError::io("creating optimiser log", e))?;
    let log_err = log
        .try_clone()
        .map_err(|e| EngineError::io("creating optimiser log", e))?;

    Command::new(&settings.executable)
        .arg(INPUT_FILE)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .spawn()
        .map_err(|e| {
            EngineError::io(
                format!("starting optimiser '{}'", settings.executable.display()),
                e,
            )
        })
}

fn connect(
    address: &SocketAddress,
    timeout: Duration,
    handle: &mut OptimizerHandle,
) -> Result<IpiStream, EngineError> {
    let deadline = Instant::now() + timeout;
    loop {
        match IpiStream::connect(address) {
            Ok(stream) => return Ok(stream),
            Err(e) if Instant::now() >= deadline => {
                return Err(EngineError::io(
                    format!("connecting to optimiser at {}", address),
                    e,
                ));
            }
            Err(_) => {}
        }
        if let Some(status) = handle.process_status()? {
            return Err(EngineError::io(
                format!("connecting to optimiser at {}", address),
                io::Error::other(format!("optimiser exited early with {}", status)),
            ));
        }
        thread::sleep(CONNECT_RETRY);
    }
}

fn write_initial_geometry(
    molecule: &Molecule,
    partition: &AtomPartition,
    path: &Path,
) -> Result<(), EngineError> {
    let atoms = &molecule.root().atoms;
    let frame = XyzFrame {
        comment: "positions{angstrom}".to_string(),
        atoms: partition
            .order
            .iter()
            .filter_map(|i| atoms.get(i))
            .map(|a| (a.element.clone(), a.position))
            .collect(),
    };
    XyzFile::write_to_path(&frame, path).map_err(|e| EngineError::Internal(e.to_string()))
}

/// Renders the i-PI input of one slice.
///
/// Frozen atoms are listed by their position in the exchanged atom order. Thresholds are
/// passed on as i-PI tolerances; the driver still decides convergence itself and stops the
/// optimiser through the sentinel file.
pub fn ipi_input(
    settings: &OptimisationSettings,
    address: &SocketAddress,
    partition: &AtomPartition,
    depth: usize,
) -> String {
    let fixed: Vec<String> = partition
        .order
        .iter()
        .enumerate()
        .filter(|(_, i)| partition.frozen.contains(i))
        .map(|(slot, _)| slot.to_string())
        .collect();

    let socket = match address {
        SocketAddress::Unix { name } => {
            format!("<ffsocket name='strata' mode='unix'>\n    <address>{}</address>\n  </ffsocket>", name)
        }
        SocketAddress::Inet { host, port } => format!(
            "<ffsocket name='strata' mode='inet'>\n    <address>{}</address>\n    <port>{}</port>\n  </ffsocket>",
            host, port
        ),
    };

    let t = &settings.thresholds;
    let mut xml = String::new();
    let _ = writeln!(xml, "<simulation verbosity='low'>");
    let _ = writeln!(xml, "  <output prefix='slice_{}'>", depth);
    let _ = writeln!(
        xml,
        "    <properties stride='1' filename='out'>[step, potential]</properties>"
    );
    let _ = writeln!(
        xml,
        "    <trajectory filename='pos' stride='1' format='xyz'>positions{{angstrom}}</trajectory>"
    );
    let _ = writeln!(xml, "  </output>");
    let _ = writeln!(xml, "  <total_steps>{}</total_steps>", settings.max_cycles);
    let _ = writeln!(xml, "  {}", socket);
    let _ = writeln!(xml, "  <system>");
    let _ = writeln!(xml, "    <initialize nbeads='1'>");
    let _ = writeln!(
        xml,
        "      <file mode='xyz' units='angstrom'>{}</file>",
        INIT_FILE
    );
    let _ = writeln!(xml, "    </initialize>");
    let _ = writeln!(xml, "    <forces><force forcefield='strata'/></forces>");
    let _ = writeln!(xml, "    <motion mode='minimize'>");
    let _ = writeln!(xml, "      <fixcom>False</fixcom>");
    let _ = writeln!(xml, "      <fixatoms>[{}]</fixatoms>", fixed.join(", "));
    let _ = writeln!(
        xml,
        "      <optimizer mode='{}'>",
        settings.optimiser.ipi_mode()
    );
    let _ = writeln!(xml, "        <tolerances>");
    let _ = writeln!(xml, "          <energy>{:e}</energy>", t.energy_change);
    let _ = writeln!(xml, "          <force>{:e}</force>", t.max_force);
    let _ = writeln!(xml, "          <position>{:e}</position>", t.max_displacement);
    let _ = writeln!(xml, "        </tolerances>");
    let _ = writeln!(xml, "      </optimizer>");
    let _ = writeln!(xml, "    </motion>");
    let _ = writeln!(xml, "  </system>");
    let _ = writeln!(xml, "</simulation>");
    xml
}
