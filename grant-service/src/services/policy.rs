//! Rule evaluation.
//!
//! Pure functions over a snapshot of rules: whether an identity may receive
//! credentials for a (host, db), and whether a ruler may write a given rule.

use crate::models::{Role, Rule, RuleDraft, Ruler, Scope, Which};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleEvaluator;

impl RuleEvaluator {
    /// Deny wins over allow; no matching rule is a deny.
    ///
    /// `role` does not take part in matching: an allow for (host, db) covers
    /// every supported role.
    pub fn decide(rules: &[Rule], email: &str, host: &str, db: &str, _role: Role) -> Decision {
        let mut allowed = false;
        for rule in rules.iter().filter(|r| rule_matches(r, email, host, db)) {
            match rule.which {
                Which::Deny => return Decision::Deny,
                Which::Allow => allowed = true,
            }
        }
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    /// Whether some allow rule names this email, whatever its hosts and dbs.
    pub fn email_has_allow_rule(rules: &[Rule], email: &str) -> bool {
        rules
            .iter()
            .any(|r| r.which == Which::Allow && email_in_scope(&r.emails, email))
    }

    /// A ruler may only write rules whose every field lies inside their own scope.
    pub fn authorize_rule_write(ruler: Option<&Ruler>, proposed: &RuleDraft) -> Decision {
        let Some(ruler) = ruler else {
            return Decision::Deny;
        };

        let within = covers(&ruler.hosts, &proposed.hosts, |r, p| r == p)
            && covers(&ruler.dbs, &proposed.dbs, |r, p| p.starts_with(r.as_str()))
            && covers(&ruler.emails, &proposed.emails, |r, p| email_pattern_covers(r, p))
            && ruler.which.matches_any(|w| *w == proposed.which);

        if within {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }
}

fn rule_matches(rule: &Rule, email: &str, host: &str, db: &str) -> bool {
    rule.hosts.matches_any(|h| h == host)
        && rule.dbs.matches_any(|prefix| db.starts_with(prefix.as_str()))
        && email_in_scope(&rule.emails, email)
}

fn email_in_scope(emails: &Scope<String>, email: &str) -> bool {
    emails.matches_any(|pattern| email_pattern_covers(pattern, email))
}

/// `pattern` is an exact address or an `@domain` suffix.
fn email_pattern_covers(pattern: &str, candidate: &str) -> bool {
    pattern == candidate || (pattern.starts_with('@') && candidate.ends_with(pattern))
}

fn covers<T, F>(held: &Scope<T>, proposed: &Scope<T>, contains: F) -> bool
where
    T: Ord,
    F: Fn(&T, &T) -> bool,
{
    match (held, proposed) {
        (Scope::All, _) => true,
        (Scope::Only(_), Scope::All) => false,
        (Scope::Only(held), Scope::Only(proposed)) => proposed
            .iter()
            .all(|p| held.iter().any(|h| contains(h, p))),
    }
}
