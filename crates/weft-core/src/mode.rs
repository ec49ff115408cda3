//! Scheduler and partitioner flag sets
//!
//! Both are thin newtypes over an integer with explicit set operations, so
//! callers combine named flags instead of raw bits:
//!
//! ```ignore
//! let mode = SchedulerMode::DEFAULT_MODE.without(SchedulerMode::ENABLE_STEALING_NUMA);
//! assert!(mode.contains(SchedulerMode::ENABLE_STEALING));
//! ```

use core::fmt;
use core::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

macro_rules! flag_set {
    (
        $(#[$meta:meta])*
        $name:ident($repr:ty) {
            $( $(#[$fmeta:meta])* $flag:ident = $value:expr => $label:literal, )*
        }
        all = $all:expr;
    ) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
        pub struct $name($repr);

        impl $name {
            $( $(#[$fmeta])* pub const $flag: $name = $name($value); )*

            /// Every defined flag
            pub const ALL_FLAGS: $name = $name($all);

            const NAMED: &'static [($name, &'static str)] = &[ $( ($name($value), $label), )* ];

            #[inline]
            pub const fn bits(self) -> $repr {
                self.0
            }

            /// Build from raw bits, dropping undefined ones
            #[inline]
            pub const fn from_bits_truncate(bits: $repr) -> Self {
                $name(bits & $all)
            }

            #[inline]
            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            /// True when every flag of `other` is set in `self`
            #[inline]
            pub const fn contains(self, other: $name) -> bool {
                other.0 != 0 && self.0 & other.0 == other.0
            }

            #[inline]
            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            #[inline]
            pub const fn union(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }

            #[inline]
            pub const fn intersection(self, other: $name) -> $name {
                $name(self.0 & other.0)
            }

            /// Complement restricted to the defined flags
            #[inline]
            pub const fn complement(self) -> $name {
                $name(!self.0 & $all)
            }

            #[inline]
            pub const fn without(self, other: $name) -> $name {
                $name(self.0 & !other.0)
            }

            /// Parse a `|`/`,` separated list of flag names
            pub fn parse(s: &str) -> Option<$name> {
                let mut out = $name(0);
                for token in s.split(|c| c == '|' || c == ',').map(str::trim) {
                    if token.is_empty() {
                        continue;
                    }
                    let (flag, _) = Self::NAMED
                        .iter()
                        .chain(core::iter::once(&($name::ALL_FLAGS, "all_flags")))
                        .find(|(_, label)| label.eq_ignore_ascii_case(token))?;
                    out = out.union(*flag);
                }
                Some(out)
            }
        }

        impl BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                self.union(rhs)
            }
        }

        impl BitOrAssign for $name {
            fn bitor_assign(&mut self, rhs: $name) {
                *self = self.union(rhs);
            }
        }

        impl BitAnd for $name {
            type Output = $name;
            fn bitand(self, rhs: $name) -> $name {
                self.intersection(rhs)
            }
        }

        impl BitAndAssign for $name {
            fn bitand_assign(&mut self, rhs: $name) {
                *self = self.intersection(rhs);
            }
        }

        impl Not for $name {
            type Output = $name;
            fn not(self) -> $name {
                self.complement()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut first = true;
                for (flag, label) in Self::NAMED {
                    if flag.0 != 0 && self.contains(*flag) {
                        if !first {
                            f.write_str("|")?;
                        }
                        f.write_str(label)?;
                        first = false;
                    }
                }
                if first {
                    f.write_str(Self::NAMED[0].1)?;
                }
                Ok(())
            }
        }
    };
}

flag_set! {
    /// Behaviour flags of one scheduler instance
    SchedulerMode(u32) {
        /// No special behaviour
        NOTHING_SPECIAL = 0x000 => "nothing_special",
        /// Run workers at a lowered OS priority
        REDUCE_THREAD_PRIORITY = 0x001 => "reduce_thread_priority",
        /// Allow workers to be taken offline and brought back
        ENABLE_ELASTICITY = 0x002 => "enable_elasticity",
        /// Idle workers may take work from other workers' queues
        ENABLE_STEALING = 0x004 => "enable_stealing",
        /// Stealing may cross NUMA nodes
        ENABLE_STEALING_NUMA = 0x008 => "enable_stealing_numa",
        /// Spread hint-less work round robin over worker queues
        ASSIGN_WORK_ROUND_ROBIN = 0x010 => "assign_work_round_robin",
        /// Place hint-less work on the queue of the worker that created it
        ASSIGN_WORK_THREAD_PARENT = 0x020 => "assign_work_thread_parent",
        /// Steal from the highest priority class first
        STEAL_HIGH_PRIORITY_FIRST = 0x040 => "steal_high_priority_first",
        /// Only steal once the local and shared queues are empty
        STEAL_AFTER_LOCAL = 0x080 => "steal_after_local",
        /// Back off exponentially while idle instead of parking right away
        ENABLE_IDLE_BACKOFF = 0x100 => "enable_idle_backoff",
    }
    all = 0x1ff;
}

impl SchedulerMode {
    pub const DEFAULT_MODE: SchedulerMode = SchedulerMode(
        SchedulerMode::REDUCE_THREAD_PRIORITY.0
            | SchedulerMode::ENABLE_STEALING.0
            | SchedulerMode::ENABLE_STEALING_NUMA.0
            | SchedulerMode::ASSIGN_WORK_ROUND_ROBIN.0
            | SchedulerMode::STEAL_AFTER_LOCAL.0,
    );
}

flag_set! {
    /// How the resource partitioner may hand out processing units
    PartitionerMode(u8) {
        DEFAULT = 0x0 => "default",
        /// Pools may share processing units
        ALLOW_OVERSUBSCRIPTION = 0x1 => "allow_oversubscription",
        /// Pools may be created after the runtime started
        ALLOW_DYNAMIC_POOLS = 0x2 => "allow_dynamic_pools",
    }
    all = 0x3;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_mode_flags() {
        let m = SchedulerMode::DEFAULT_MODE;
        assert!(m.contains(SchedulerMode::ENABLE_STEALING));
        assert!(m.contains(SchedulerMode::STEAL_AFTER_LOCAL));
        assert!(!m.contains(SchedulerMode::ENABLE_IDLE_BACKOFF));
        assert!(!m.contains(SchedulerMode::NOTHING_SPECIAL));
        assert_eq!(m.bits(), 0x9d);
    }

    #[test]
    fn test_set_operations() {
        let a = SchedulerMode::ENABLE_STEALING | SchedulerMode::ENABLE_IDLE_BACKOFF;
        let b = SchedulerMode::ENABLE_STEALING | SchedulerMode::ENABLE_ELASTICITY;
        assert_eq!(a & b, SchedulerMode::ENABLE_STEALING);
        assert_eq!((!a) & a, SchedulerMode::NOTHING_SPECIAL);
        assert_eq!(!a | a, SchedulerMode::ALL_FLAGS);
        assert_eq!(a.without(SchedulerMode::ENABLE_STEALING), SchedulerMode::ENABLE_IDLE_BACKOFF);
        assert_eq!(!SchedulerMode::NOTHING_SPECIAL, SchedulerMode::ALL_FLAGS);
        assert_eq!(SchedulerMode::from_bits_truncate(0xffff_ffff), SchedulerMode::ALL_FLAGS);
    }

    #[test]
    fn test_parse_and_display() {
        let m = SchedulerMode::parse("enable_stealing | steal_after_local").unwrap();
        assert_eq!(m, SchedulerMode::ENABLE_STEALING | SchedulerMode::STEAL_AFTER_LOCAL);
        assert_eq!(m.to_string(), "enable_stealing|steal_after_local");
        assert_eq!(SchedulerMode::NOTHING_SPECIAL.to_string(), "nothing_special");
        assert_eq!(SchedulerMode::parse("all_flags"), Some(SchedulerMode::ALL_FLAGS));
        assert_eq!(SchedulerMode::parse(""), Some(SchedulerMode::NOTHING_SPECIAL));
        assert!(SchedulerMode::parse("go_fast").is_none());
    }

    #[test]
    fn test_partitioner_mode() {
        let m = PartitionerMode::ALLOW_OVERSUBSCRIPTION | PartitionerMode::ALLOW_DYNAMIC_POOLS;
        assert!(m.contains(PartitionerMode::ALLOW_DYNAMIC_POOLS));
        assert!(!PartitionerMode::DEFAULT.intersects(PartitionerMode::ALLOW_OVERSUBSCRIPTION));
        assert_eq!(PartitionerMode::parse("allow_oversubscription").unwrap().bits(), 1);
    }
}
