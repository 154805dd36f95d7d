use serde::{Deserialize, Serialize};

/// Safety classification of a tool.
///
/// Assigned once at registration and never revised at call time — a
/// hazardous tool cannot talk its way into the free path by varying its
/// arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum ToolClass {
    /// Side-effect-free and free of charge. Executes immediately.
    Free,
    /// Costs money (cloud API call). Gated by the budget ledger.
    Cloud { est_cost_usd: f64 },
    /// Physically or destructively consequential. Always parked behind a
    /// human confirmation token, regardless of budget state.
    Hazardous { hazard_class: HazardClass },
}

/// What makes a hazardous tool hazardous. Drives the wording of the
/// confirmation prompt, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HazardClass {
    /// Moves something in the physical world (printer, actuator, vehicle).
    Physical,
    /// Destroys or overwrites data.
    Destructive,
    /// Sends something externally visible (message, purchase, post).
    Outbound,
}

impl HazardClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            HazardClass::Physical => "physical",
            HazardClass::Destructive => "destructive",
            HazardClass::Outbound => "outbound",
        }
    }
}

impl ToolClass {
    pub fn label(&self) -> &'static str {
        match self {
            ToolClass::Free => "free",
            ToolClass::Cloud { .. } => "cloud",
            ToolClass::Hazardous { .. } => "hazardous",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_serializes_tagged() {
        let c = ToolClass::Hazardous {
            hazard_class: HazardClass::Physical,
        };
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["class"], "hazardous");
        assert_eq!(json["hazard_class"], "physical");
    }
}
