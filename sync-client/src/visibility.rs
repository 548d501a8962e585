use tokio::sync::watch;

/// Whether the host is currently showing the dashboard.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

/// Host-supplied visibility signal.
pub trait VisibilitySource: Send + Sync {
    fn subscribe(&self) -> watch::Receiver<Visibility>;
}

/// Visibility adapter driven by hand: a headless host flips it from its own events, tests flip
/// it directly.
#[derive(Debug)]
pub struct VisibilityController {
    sender: watch::Sender<Visibility>,
}

impl Default for VisibilityController {
    fn default() -> Self {
        Self::new(Visibility::Visible)
    }
}

impl VisibilityController {
    pub fn new(initial: Visibility) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn set(&self, visibility: Visibility) {
        let previous = self.sender.send_replace(visibility);
        if previous != visibility {
            log::debug!("Visibility changed to {:?}", visibility);
        }
    }

    pub fn hide(&self) {
        self.set(Visibility::Hidden);
    }

    pub fn show(&self) {
        self.set(Visibility::Visible);
    }

    pub fn toggle(&self) -> Visibility {
        let next = match self.current() {
            Visibility::Visible => Visibility::Hidden,
            Visibility::Hidden => Visibility::Visible,
        };
        self.set(next);
        next
    }

    pub fn current(&self) -> Visibility {
        *self.sender.borrow()
    }
}

impl VisibilitySource for VisibilityController {
    fn subscribe(&self) -> watch::Receiver<Visibility> {
        self.sender.subscribe()
    }
}

/// For hosts without any notion of visibility.
#[derive(Clone, Copy, Debug, Default)]
pub struct AlwaysVisible;

impl VisibilitySource for AlwaysVisible {
    fn subscribe(&self) -> watch::Receiver<Visibility> {
        let (_, receiver) = watch::channel(Visibility::Visible);
        receiver
    }
}
