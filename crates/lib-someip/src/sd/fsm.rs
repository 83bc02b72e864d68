use std::time::{Duration, Instant};

use rand::Rng;

use crate::config::SdConfig;

/// Announce phases of the host-level SD machine. All locally offered
/// services share one cycle; a newly offered service during Main is
/// announced immediately within the running cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnouncePhase {
    /// Network down or discovery stopped.
    Inactive,
    /// Waiting the randomized initial delay.
    InitialWait,
    /// Exponentially spaced announce bursts.
    Repetition,
    /// Cyclic offers.
    Main,
}

/// Timer-driven announce machine: InitialWait → Repetition^max → Main.
#[derive(Debug)]
pub struct AnnounceFsm {
    config: SdConfig,
    phase: AnnouncePhase,
    run: u8,
    deadline: Option<Instant>,
    last_offer: Option<Instant>,
}

/// What the engine must do after a timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceAction {
    None,
    SendOffers,
}

impl AnnounceFsm {
    pub fn new(config: &SdConfig) -> Self {
        Self {
            config: config.clone(),
            phase: AnnouncePhase::Inactive,
            run: 0,
            deadline: None,
            last_offer: None,
        }
    }

    pub fn phase(&self) -> AnnouncePhase {
        self.phase
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_active(&self) -> bool {
        self.phase != AnnouncePhase::Inactive
    }

    /// Network came up: start the initial wait with a randomized delay
    /// in [initial_delay_min, initial_delay_max].
    pub fn activate(&mut self, now: Instant) {
        let min = self.config.initial_delay_min;
        let max = self.config.initial_delay_max;
        let delay = if max > min {
            let range = (max - min).as_millis() as u64;
            min + Duration::from_millis(rand::thread_rng().gen_range(0..=range))
        } else {
            min
        };
        self.phase = AnnouncePhase::InitialWait;
        self.run = 0;
        self.deadline = Some(now + delay);
        self.last_offer = None;
    }

    pub fn deactivate(&mut self) {
        self.phase = AnnouncePhase::Inactive;
        self.run = 0;
        self.deadline = None;
        self.last_offer = None;
    }

    /// Advances the machine when its deadline fired.
    pub fn on_timeout(&mut self, now: Instant) -> AnnounceAction {
        match self.phase {
            AnnouncePhase::Inactive => AnnounceAction::None,
            AnnouncePhase::InitialWait => {
                // First burst of the repetition phase goes out at entry.
                self.phase = AnnouncePhase::Repetition;
                self.run = 0;
                self.deadline = Some(now + self.repetition_delay());
                self.run = 1;
                self.last_offer = Some(now);
                AnnounceAction::SendOffers
            }
            AnnouncePhase::Repetition => {
                if self.run >= self.config.repetitions_max {
                    self.phase = AnnouncePhase::Main;
                    self.deadline = Some(now + self.config.cyclic_offer_delay);
                    self.last_offer = Some(now);
                    AnnounceAction::SendOffers
                } else {
                    self.deadline = Some(now + self.repetition_delay());
                    self.run += 1;
                    self.last_offer = Some(now);
                    AnnounceAction::SendOffers
                }
            }
            AnnouncePhase::Main => {
                self.deadline = Some(now + self.config.cyclic_offer_delay);
                self.last_offer = Some(now);
                AnnounceAction::SendOffers
            }
        }
    }

    fn repetition_delay(&self) -> Duration {
        // base × 2^run, matching the doubling announce cadence.
        self.config.repetitions_base_delay * (1u32 << u32::from(self.run))
    }

    /// Half-cycle rule for answering a FindService in the Main phase:
    /// answered via multicast when at least half the cyclic delay has
    /// passed since the last multicast offer.
    pub fn answer_by_multicast(&self, now: Instant) -> bool {
        match self.last_offer {
            Some(last) => now.duration_since(last) >= self.config.cyclic_offer_delay / 2,
            None => true,
        }
    }

    /// Records an out-of-cycle multicast offer so the half-cycle rule
    /// accounts for it.
    pub fn note_multicast_offer(&mut self, now: Instant) {
        self.last_offer = Some(now);
    }
}

/// Repeated FindService attempts for requested-but-missing services,
/// capped at `repetitions_max` runs until a new request arrives.
#[derive(Debug)]
pub struct FindFsm {
    config: SdConfig,
    run: u8,
    deadline: Option<Instant>,
}

impl FindFsm {
    pub fn new(config: &SdConfig) -> Self {
        Self {
            config: config.clone(),
            run: 0,
            deadline: None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// A new request (re)starts the find cycle.
    pub fn activate(&mut self, now: Instant) {
        self.run = 0;
        self.deadline = Some(now + self.config.find_debounce_time);
    }

    pub fn deactivate(&mut self) {
        self.run = 0;
        self.deadline = None;
    }

    /// Whether a find burst goes out now; re-arms the timer until the
    /// run count is exhausted.
    pub fn on_timeout(&mut self, now: Instant) -> bool {
        if self.deadline.is_none() {
            return false;
        }
        if self.run >= self.config.repetitions_max {
            self.deadline = None;
            return false;
        }
        self.run += 1;
        let delay = self.config.repetitions_base_delay * (1u32 << u32::from(self.run));
        self.deadline = Some(now + delay);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SdConfig {
        SdConfig {
            initial_delay_min: Duration::from_millis(10),
            initial_delay_max: Duration::from_millis(50),
            repetitions_base_delay: Duration::from_millis(10),
            repetitions_max: 3,
            cyclic_offer_delay: Duration::from_millis(1000),
            ..SdConfig::default()
        }
    }

    #[test]
    fn walks_through_the_phases() {
        let mut fsm = AnnounceFsm::new(&config());
        assert_eq!(fsm.phase(), AnnouncePhase::Inactive);

        let now = Instant::now();
        fsm.activate(now);
        assert_eq!(fsm.phase(), AnnouncePhase::InitialWait);
        let delay = fsm.deadline().unwrap() - now;
        assert!(delay >= Duration::from_millis(10) && delay <= Duration::from_millis(50));

        assert_eq!(fsm.on_timeout(now), AnnounceAction::SendOffers);
        assert_eq!(fsm.phase(), AnnouncePhase::Repetition);

        // three repetition runs, then main
        assert_eq!(fsm.on_timeout(now), AnnounceAction::SendOffers);
        assert_eq!(fsm.phase(), AnnouncePhase::Repetition);
        assert_eq!(fsm.on_timeout(now), AnnounceAction::SendOffers);
        assert_eq!(fsm.on_timeout(now), AnnounceAction::SendOffers);
        assert_eq!(fsm.phase(), AnnouncePhase::Main);

        assert_eq!(fsm.on_timeout(now), AnnounceAction::SendOffers);
        assert_eq!(fsm.phase(), AnnouncePhase::Main);
    }

    #[test]
    fn repetition_delays_double() {
        let mut fsm = AnnounceFsm::new(&config());
        let now = Instant::now();
        fsm.activate(now);
        fsm.on_timeout(now);

        let first = fsm.deadline().unwrap() - now;
        fsm.on_timeout(now);
        let second = fsm.deadline().unwrap() - now;
        assert_eq!(first, Duration::from_millis(10));
        assert_eq!(second, Duration::from_millis(20));
    }

    #[test]
    fn half_cycle_rule() {
        let mut fsm = AnnounceFsm::new(&config());
        let now = Instant::now();
        fsm.activate(now);
        fsm.on_timeout(now);

        assert!(!fsm.answer_by_multicast(now + Duration::from_millis(100)));
        assert!(fsm.answer_by_multicast(now + Duration::from_millis(600)));
    }

    #[test]
    fn find_cycle_is_bounded() {
        let mut find = FindFsm::new(&config());
        let now = Instant::now();
        find.activate(now);

        assert!(find.on_timeout(now));
        assert!(find.on_timeout(now));
        assert!(find.on_timeout(now));
        assert!(!find.on_timeout(now));
        assert_eq!(find.deadline(), None);
    }
}
