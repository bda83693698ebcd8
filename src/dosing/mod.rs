use crate::error::{TciError, TciResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DoseEvent {
    pub time: f64,
    #[serde(default)]
    pub bolus: f64,
    #[serde(default)]
    pub infusion_rate: Option<f64>, // mg/kg/h, None keeps the running rate
}

impl DoseEvent {
    pub fn bolus(time: f64, amount: f64) -> Self {
        Self {
            time,
            bolus: amount,
            infusion_rate: None,
        }
    }

    pub fn infusion(time: f64, rate: f64) -> Self {
        Self {
            time,
            bolus: 0.0,
            infusion_rate: Some(rate),
        }
    }

    pub fn bolus_and_infusion(time: f64, amount: f64, rate: f64) -> Self {
        Self {
            time,
            bolus: amount,
            infusion_rate: Some(rate),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DosingSchedule {
    events: Vec<DoseEvent>,
}

impl DosingSchedule {
    pub fn new(mut events: Vec<DoseEvent>) -> TciResult<Self> {
        for event in &events {
            if !event.time.is_finite() || event.time < 0.0 {
                return Err(TciError::InvalidDosing(format!(
                    "dose time must be a non-negative number (got {})",
                    event.time
                )));
            }
            if !event.bolus.is_finite() || event.bolus < 0.0 {
                return Err(TciError::InvalidDosing(format!(
                    "bolus must be non-negative (got {} mg at t={})",
                    event.bolus, event.time
                )));
            }
            if let Some(rate) = event.infusion_rate {
                if !rate.is_finite() || rate < 0.0 {
                    return Err(TciError::InvalidDosing(format!(
                        "infusion rate must be non-negative (got {} mg/kg/h at t={})",
                        rate, event.time
                    )));
                }
            }
        }
        events.sort_by(|a, b| a.time.total_cmp(&b.time));
        Ok(Self { events })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[DoseEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn push(&mut self, event: DoseEvent) -> TciResult<()> {
        let last = self.events.last().map_or(0.0, |e| e.time);
        if event.time < last {
            return Err(TciError::InvalidDosing(format!(
                "event at t={} precedes the last scheduled event at t={}",
                event.time, last
            )));
        }
        let mut events = self.events.clone();
        events.push(event);
        *self = Self::new(events)?;
        Ok(())
    }

    /// Events from index `from` onward with `event.time <= time`.
    pub fn due(&self, from: usize, time: f64) -> &[DoseEvent] {
        let rest = &self.events[from.min(self.events.len())..];
        let n = rest.partition_point(|e| e.time <= time);
        &rest[..n]
    }

    pub fn infusion_rate_at(&self, time: f64) -> f64 {
        self.events
            .iter()
            .take_while(|e| e.time <= time)
            .filter_map(|e| e.infusion_rate)
            .last()
            .unwrap_or(0.0)
    }
}
