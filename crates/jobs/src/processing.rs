use core::str::FromStr;
use serde::{Deserialize, Serialize};

use audioflow_core::DomainError;

/// Declared transformation requested for an uploaded file.
///
/// The set is closed: submissions naming anything else are rejected before a
/// job is ever created.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingType {
    SpeechEnhancement,
    SpeechSeparation,
    SpeechSuperResolution,
    TargetSpeakerExtraction,
}

impl ProcessingType {
    pub const ALL: [ProcessingType; 4] = [
        ProcessingType::SpeechEnhancement,
        ProcessingType::SpeechSeparation,
        ProcessingType::SpeechSuperResolution,
        ProcessingType::TargetSpeakerExtraction,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingType::SpeechEnhancement => "speech_enhancement",
            ProcessingType::SpeechSeparation => "speech_separation",
            ProcessingType::SpeechSuperResolution => "speech_super_resolution",
            ProcessingType::TargetSpeakerExtraction => "target_speaker_extraction",
        }
    }
}

impl core::fmt::Display for ProcessingType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessingType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| {
                DomainError::validation(format!(
                    "unsupported processing type '{s}'; expected one of: {}",
                    ProcessingType::ALL
                        .iter()
                        .map(|t| t.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}
