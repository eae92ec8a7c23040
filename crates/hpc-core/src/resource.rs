//! Multi-dimensional resource quantities.
//!
//! A [`ResourceVector`] carries procs, memory, disk, swap and a map of
//! named generic resources. Arithmetic is componentwise; generic resources
//! merge by key. A dimension set to [`UNLIMITED`] in a per-task demand means
//! "all of this dimension on the node".

use std::collections::BTreeMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use serde::{Deserialize, Serialize};

/// Sentinel for an unlimited / whole-node dimension.
pub const UNLIMITED: i64 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVector {
    #[serde(default)]
    pub procs: i64,
    #[serde(default)]
    pub memory_mb: i64,
    #[serde(default)]
    pub disk_mb: i64,
    #[serde(default)]
    pub swap_mb: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub generic: BTreeMap<String, i64>,
}

impl ResourceVector {
    pub fn new(procs: i64, memory_mb: i64, disk_mb: i64, swap_mb: i64) -> Self {
        Self {
            procs,
            memory_mb,
            disk_mb,
            swap_mb,
            generic: BTreeMap::new(),
        }
    }

    /// A vector with only procs set.
    pub fn procs(procs: i64) -> Self {
        Self::new(procs, 0, 0, 0)
    }

    pub fn with_generic(mut self, name: &str, count: i64) -> Self {
        self.generic.insert(name.to_string(), count);
        self
    }

    pub fn generic(&self, name: &str) -> i64 {
        self.generic.get(name).copied().unwrap_or(0)
    }

    pub fn set_generic(&mut self, name: &str, count: i64) {
        if count == 0 {
            self.generic.remove(name);
        } else {
            self.generic.insert(name.to_string(), count);
        }
    }

    pub fn is_zero(&self) -> bool {
        self.procs == 0
            && self.memory_mb == 0
            && self.disk_mb == 0
            && self.swap_mb == 0
            && self.generic.values().all(|v| *v == 0)
    }

    /// True if every finite dimension is non-negative.
    pub fn is_valid(&self) -> bool {
        let ok = |v: i64| v >= 0 || v == UNLIMITED;
        ok(self.procs)
            && ok(self.memory_mb)
            && ok(self.disk_mb)
            && ok(self.swap_mb)
            && self.generic.values().all(|v| ok(*v))
    }

    /// True if no dimension is negative, [`UNLIMITED`] included.
    pub fn is_non_negative(&self) -> bool {
        self.procs >= 0
            && self.memory_mb >= 0
            && self.disk_mb >= 0
            && self.swap_mb >= 0
            && self.generic.values().all(|v| *v >= 0)
    }

    /// Componentwise `self <= other`. An unlimited dimension in `other`
    /// accepts anything; an unlimited dimension in `self` only fits an
    /// unlimited dimension.
    pub fn fits_within(&self, other: &ResourceVector) -> bool {
        let fits = |a: i64, b: i64| b == UNLIMITED || (a != UNLIMITED && a <= b);
        fits(self.procs, other.procs)
            && fits(self.memory_mb, other.memory_mb)
            && fits(self.disk_mb, other.disk_mb)
            && fits(self.swap_mb, other.swap_mb)
            && self
                .generic
                .iter()
                .all(|(k, v)| fits(*v, other.generic(k)))
    }

    /// Componentwise `max(0, self - other)`.
    pub fn saturating_sub(&self, other: &ResourceVector) -> ResourceVector {
        self.zip_with(other, |a, b| {
            if a == UNLIMITED {
                UNLIMITED
            } else if b == UNLIMITED {
                0
            } else {
                (a - b).max(0)
            }
        })
    }

    /// Componentwise minimum, treating [`UNLIMITED`] as infinite.
    pub fn min(&self, other: &ResourceVector) -> ResourceVector {
        self.zip_with(other, |a, b| match (a == UNLIMITED, b == UNLIMITED) {
            (true, _) => b,
            (_, true) => a,
            _ => a.min(b),
        })
    }

    /// Per-task demand multiplied by a task count.
    pub fn scaled(&self, tasks: u32) -> ResourceVector {
        let n = i64::from(tasks);
        let mul = |v: i64| if v == UNLIMITED { UNLIMITED } else { v * n };
        ResourceVector {
            procs: mul(self.procs),
            memory_mb: mul(self.memory_mb),
            disk_mb: mul(self.disk_mb),
            swap_mb: mul(self.swap_mb),
            generic: self.generic.iter().map(|(k, v)| (k.clone(), mul(*v))).collect(),
        }
    }

    /// Resolve [`UNLIMITED`] demand dimensions against a node's configured
    /// resources, producing the concrete per-task footprint on that node.
    pub fn resolve_against(&self, configured: &ResourceVector) -> ResourceVector {
        self.zip_with(configured, |d, c| if d == UNLIMITED { c.max(0) } else { d })
    }

    /// Number of whole tasks of `demand` that fit in `self` (available).
    ///
    /// Takes the floor of `available / demand` over every dimension with a
    /// non-zero demand. A dimension demanded as [`UNLIMITED`] requires the
    /// whole configured amount to be available and yields at most one task.
    /// A negative demand other than [`UNLIMITED`] fits nothing. Returns
    /// `u32::MAX` when the demand constrains nothing.
    pub fn tasks_fitting(&self, demand: &ResourceVector, configured: &ResourceVector) -> u32 {
        let mut tasks = u64::from(u32::MAX);

        let mut dim = |avail: i64, need: i64, conf: i64| {
            if need == 0 || avail == UNLIMITED {
                return;
            }
            let fit = if need == UNLIMITED {
                u64::from(conf > 0 && avail >= conf)
            } else if need < 0 || avail <= 0 {
                0
            } else {
                (avail / need) as u64
            };
            tasks = tasks.min(fit);
        };

        dim(self.procs, demand.procs, configured.procs);
        dim(self.memory_mb, demand.memory_mb, configured.memory_mb);
        dim(self.disk_mb, demand.disk_mb, configured.disk_mb);
        dim(self.swap_mb, demand.swap_mb, configured.swap_mb);
        for (name, need) in &demand.generic {
            dim(self.generic(name), *need, configured.generic(name));
        }

        tasks as u32
    }

    fn zip_with(&self, other: &ResourceVector, f: impl Fn(i64, i64) -> i64) -> ResourceVector {
        let mut generic = BTreeMap::new();
        for key in self.generic.keys().chain(other.generic.keys()) {
            if generic.contains_key(key) {
                continue;
            }
            let v = f(self.generic(key), other.generic(key));
            if v != 0 {
                generic.insert(key.clone(), v);
            }
        }
        ResourceVector {
            procs: f(self.procs, other.procs),
            memory_mb: f(self.memory_mb, other.memory_mb),
            disk_mb: f(self.disk_mb, other.disk_mb),
            swap_mb: f(self.swap_mb, other.swap_mb),
            generic,
        }
    }
}

fn add_dim(a: i64, b: i64) -> i64 {
    if a == UNLIMITED || b == UNLIMITED {
        UNLIMITED
    } else {
        a + b
    }
}

fn sub_dim(a: i64, b: i64) -> i64 {
    if a == UNLIMITED {
        UNLIMITED
    } else {
        a - b
    }
}

impl Add for &ResourceVector {
    type Output = ResourceVector;
    fn add(self, rhs: Self) -> ResourceVector {
        self.zip_with(rhs, add_dim)
    }
}

impl Sub for &ResourceVector {
    type Output = ResourceVector;
    fn sub(self, rhs: Self) -> ResourceVector {
        self.zip_with(rhs, sub_dim)
    }
}

impl AddAssign<&ResourceVector> for ResourceVector {
    fn add_assign(&mut self, rhs: &ResourceVector) {
        *self = &*self + rhs;
    }
}

impl SubAssign<&ResourceVector> for ResourceVector {
    fn sub_assign(&mut self, rhs: &ResourceVector) {
        *self = &*self - rhs;
    }
}

impl fmt::Display for ResourceVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "procs={} mem={}MB disk={}MB swap={}MB",
            self.procs, self.memory_mb, self.disk_mb, self.swap_mb
        )?;
        if !self.generic.is_empty() {
            let gres: Vec<String> = self.generic.iter().map(|(k, v)| format!("{k}:{v}")).collect();
            write!(f, " gres={}", gres.join(","))?;
        }
        Ok(())
    }
}
