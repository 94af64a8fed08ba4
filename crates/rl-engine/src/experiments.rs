use recsys_core::request::{ExperimentRef, UserRef};
use sha2::{Digest, Sha256};

const DEFAULT_EXPERIMENT_ID: &str = "default";

/// Hook that fills in an experiment variant for a request.
pub trait ExperimentAssigner: Send + Sync {
    fn assign(&self, experiment: Option<&ExperimentRef>, user: &UserRef) -> Option<ExperimentRef>;
}

/// Hashes `{salt}:{experiment_id}:{subject}` onto a fixed variant list.
#[derive(Debug, Clone)]
pub struct DeterministicAssigner {
    variants: Vec<String>,
    salt: String,
}

impl DeterministicAssigner {
    pub fn new(variants: Vec<String>, salt: impl Into<String>) -> Self {
        let variants = variants
            .into_iter()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect();
        Self {
            variants,
            salt: salt.into(),
        }
    }
}

impl ExperimentAssigner for DeterministicAssigner {
    fn assign(&self, experiment: Option<&ExperimentRef>, user: &UserRef) -> Option<ExperimentRef> {
        if let Some(exp) = experiment.filter(|e| !e.variant.is_empty()) {
            return Some(exp.clone());
        }
        let subject = user.subject_key();
        if self.variants.is_empty() || subject.is_empty() {
            return experiment.cloned();
        }

        let id = experiment
            .map(|e| e.id.trim())
            .filter(|id| !id.is_empty())
            .unwrap_or(DEFAULT_EXPERIMENT_ID)
            .to_string();
        let digest = Sha256::digest(format!("{}:{}:{}", self.salt, id, subject).as_bytes());
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        let index = (u64::from_be_bytes(head) % self.variants.len() as u64) as usize;

        Some(ExperimentRef {
            id,
            variant: self.variants[index].clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserRef {
        UserRef {
            user_id: id.into(),
            ..Default::default()
        }
    }

    fn assigner() -> DeterministicAssigner {
        DeterministicAssigner::new(vec!["A".into(), "B".into()], "salt")
    }

    #[test]
    fn test_repeated_assignment_is_stable() {
        let a = assigner();
        let first = a.assign(None, &user("user-123")).unwrap();
        assert_eq!(first.id, "default");
        assert!(first.variant == "A" || first.variant == "B");
        for _ in 0..10 {
            assert_eq!(a.assign(None, &user("user-123")).unwrap(), first);
        }
    }

    #[test]
    fn test_provided_variant_is_kept() {
        let exp = ExperimentRef {
            id: "exp".into(),
            variant: "B".into(),
        };
        assert_eq!(assigner().assign(Some(&exp), &user("user-123")), Some(exp));
    }

    #[test]
    fn test_spreads_across_variants() {
        let a = assigner();
        let exp = ExperimentRef {
            id: "homepage".into(),
            variant: String::new(),
        };
        let b_count = (0..1000)
            .filter(|i| a.assign(Some(&exp), &user(&format!("u{i}"))).unwrap().variant == "B")
            .count();
        assert!((400..600).contains(&b_count));
    }

    #[test]
    fn test_no_variants_passes_through() {
        let a = DeterministicAssigner::new(vec![" ".into()], "salt");
        assert_eq!(a.assign(None, &user("u")), None);
        let anon = UserRef::default();
        assert_eq!(assigner().assign(None, &anon), None);
    }
}
