use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[cfg(unix)]
use signal_hook::consts::signal::{SIGINT, SIGTERM};
#[cfg(unix)]
use signal_hook::flag;
#[cfg(unix)]
use signal_hook::low_level::unregister;
#[cfg(unix)]
use signal_hook::SigId;

pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    #[cfg(unix)]
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));

        #[cfg(unix)]
        {
            let id_int = flag::register(SIGINT, Arc::clone(&triggered))?;
            let id_term = flag::register(SIGTERM, Arc::clone(&triggered))?;
            return Ok(Self {
                triggered,
                sig_ids: vec![id_int, id_term],
            });
        }

        #[cfg(not(unix))]
        {
            Ok(Self { triggered })
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        #[cfg(unix)]
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}

/// Once armed, terminates the process with exit code 1 if graceful
/// shutdown has not finished within the deadline. Disarm on a clean exit
/// path lets the process return its normal exit code.
pub struct ForceExitWatchdog {
    deadline: Duration,
    disarmed: Arc<AtomicBool>,
}

impl ForceExitWatchdog {
    pub fn new(deadline: Duration) -> Self {
        Self {
            deadline,
            disarmed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn arm(&self) {
        let deadline = self.deadline;
        let disarmed = Arc::clone(&self.disarmed);
        thread::spawn(move || {
            let armed_at = Instant::now();
            while armed_at.elapsed() < deadline {
                if disarmed.load(Ordering::SeqCst) {
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            }
            if !disarmed.load(Ordering::SeqCst) {
                eprintln!("graceful shutdown deadline exceeded, forcing exit");
                std::process::exit(1);
            }
        });
    }

    pub fn disarm(&self) {
        self.disarmed.store(true, Ordering::SeqCst);
    }
}
