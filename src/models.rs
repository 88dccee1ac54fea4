//! License Feature Models
//!
//! This module defines the data structures at the heart of the license
//! database: the [`Feature`] value object and the [`FeatureSet`] collection
//! that caches features in memory.
//!
//! ## Identity
//!
//! A feature is identified two ways:
//!
//! 1. **Natural key**: the `(feature, vendor, version)` string tuple scanned
//!    out of license files and `lmstat` output
//! 2. **Surrogate id**: the integer primary key the database assigns on first
//!    insert; `None` until the feature has round-tripped through the store
//!
//! Both must be unique within a [`FeatureSet`] and within the database.
//!
//! ## Mutation Tracking
//!
//! Scanners mutate seat counters additively ([`Feature::add_issued`],
//! [`Feature::add_in_use`]) or absolutely ([`Feature::set_issued`],
//! [`Feature::set_in_use`]). Any counter mutation marks the feature modified,
//! including writes of the value already held: a sample showing zero seats
//! in use must still produce a count row at commit time. Expiration updates
//! mark the feature modified only when the timestamp actually changes.
//! Committing does not clear the flag; the tools mutate, commit once, and
//! exit.

/// One licensed software capability and its current seat counters.
#[derive(Debug, Clone)]
pub struct Feature {
    id: Option<i64>,
    feature: String,
    vendor: String,
    version: String,
    expiration: Option<i64>,
    issued: i64,
    in_use: i64,
    modified: bool,
}

impl Feature {
    /// New unpersisted feature with zeroed counters and no expiration.
    pub fn new(
        feature: impl Into<String>,
        vendor: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id: None,
            feature: feature.into(),
            vendor: vendor.into(),
            version: version.into(),
            expiration: None,
            issued: 0,
            in_use: 0,
            modified: false,
        }
    }

    /// Feature hydrated from a database row; starts unmodified.
    pub fn with_stats(
        id: Option<i64>,
        feature: impl Into<String>,
        vendor: impl Into<String>,
        version: impl Into<String>,
        expiration: Option<i64>,
        issued: i64,
        in_use: i64,
    ) -> Self {
        Self {
            id,
            feature: feature.into(),
            vendor: vendor.into(),
            version: version.into(),
            expiration,
            issued,
            in_use,
            modified: false,
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn vendor(&self) -> &str {
        &self.vendor
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Expiration as a Unix timestamp; `None` means permanent.
    pub fn expiration(&self) -> Option<i64> {
        self.expiration
    }

    pub fn issued(&self) -> i64 {
        self.issued
    }

    pub fn in_use(&self) -> i64 {
        self.in_use
    }

    /// True once any counter has been written or the expiration has changed.
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Natural key as the `feature:vendor:version` tuple string used by
    /// monitoring rules.
    pub fn tuple_string(&self) -> String {
        format!("{}:{}:{}", self.feature, self.vendor, self.version)
    }

    pub fn set_expiration(&mut self, expiration: Option<i64>) {
        if self.expiration != expiration {
            self.expiration = expiration;
            self.modified = true;
        }
    }

    pub fn set_issued(&mut self, issued: i64) {
        self.issued = issued;
        self.modified = true;
    }

    pub fn add_issued(&mut self, issued: i64) {
        self.set_issued(self.issued + issued);
    }

    pub fn set_in_use(&mut self, in_use: i64) {
        self.in_use = in_use;
        self.modified = true;
    }

    pub fn add_in_use(&mut self, in_use: i64) {
        self.set_in_use(self.in_use + in_use);
    }

    fn matches_name(
        &self,
        feature: Option<&str>,
        vendor: Option<&str>,
        version: Option<&str>,
    ) -> bool {
        feature.map_or(true, |f| f == self.feature)
            && vendor.map_or(true, |v| v == self.vendor)
            && version.map_or(true, |v| v == self.version)
    }
}

/// Ordered, deduplicated collection of [`Feature`]s.
///
/// Members are kept in ascending surrogate-id order with unassigned ids
/// first, which makes iteration deterministic. The collection is small (one
/// entry per licensed feature), so lookups are linear scans.
#[derive(Debug, Default)]
pub struct FeatureSet {
    features: Vec<Feature>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a feature, preserving id order.
    ///
    /// Returns `false` without inserting when another member already carries
    /// the same assigned id or the same `(feature, vendor, version)` tuple.
    /// Multiple unassigned-id features may coexist as long as their natural
    /// keys differ.
    pub fn add(&mut self, feature: Feature) -> bool {
        let mut insert_at = self.features.len();
        for (idx, existing) in self.features.iter().enumerate() {
            if existing.id > feature.id {
                insert_at = idx;
                break;
            }
            if existing.id == feature.id {
                if feature.id.is_some() {
                    return false;
                }
                insert_at = idx;
                break;
            }
        }
        if self
            .get_by_name(
                Some(feature.feature()),
                Some(feature.vendor()),
                Some(feature.version()),
            )
            .is_some()
        {
            return false;
        }
        self.features.insert(insert_at, feature);
        true
    }

    pub fn get_by_id(&self, id: i64) -> Option<&Feature> {
        self.features.iter().find(|f| f.id == Some(id))
    }

    pub fn get_by_id_mut(&mut self, id: i64) -> Option<&mut Feature> {
        self.features.iter_mut().find(|f| f.id == Some(id))
    }

    /// Look up by natural key; `None` components match any value, so partial
    /// lookups like "first feature from vendor X" are possible.
    pub fn get_by_name(
        &self,
        feature: Option<&str>,
        vendor: Option<&str>,
        version: Option<&str>,
    ) -> Option<&Feature> {
        self.features
            .iter()
            .find(|f| f.matches_name(feature, vendor, version))
    }

    pub fn get_by_name_mut(
        &mut self,
        feature: Option<&str>,
        vendor: Option<&str>,
        version: Option<&str>,
    ) -> Option<&mut Feature> {
        self.features
            .iter_mut()
            .find(|f| f.matches_name(feature, vendor, version))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub(crate) fn position_by_name(
        &self,
        feature: Option<&str>,
        vendor: Option<&str>,
        version: Option<&str>,
    ) -> Option<usize> {
        self.features
            .iter()
            .position(|f| f.matches_name(feature, vendor, version))
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut Feature> {
        self.features.get_mut(index)
    }
}

impl<'a> IntoIterator for &'a FeatureSet {
    type Item = &'a Feature;
    type IntoIter = std::slice::Iter<'a, Feature>;

    fn into_iter(self) -> Self::IntoIter {
        self.features.iter()
    }
}
