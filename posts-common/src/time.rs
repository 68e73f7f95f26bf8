use std::sync::Mutex;

use chrono::{DateTime, Utc};

pub trait TimeSource {
    fn current_time(&self) -> DateTime<Utc>;
}

#[derive(Clone)]
pub struct SystemTime {}

impl TimeSource for SystemTime {
    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
pub struct FixedTime {
    time: Mutex<DateTime<Utc>>,
}

impl FixedTime {
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            time: Mutex::new(time),
        }
    }

    pub fn set(&self, time: DateTime<Utc>) {
        if let Ok(mut current) = self.time.lock() {
            *current = time;
        }
    }
}

impl TimeSource for FixedTime {
    fn current_time(&self) -> DateTime<Utc> {
        match self.time.lock() {
            Ok(time) => *time,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}
