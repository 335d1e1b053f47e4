//! Read memoization scoped to one request or one logical operation.
//!
//! Callers create a `RequestCache`, pass it by reference into store lookups and
//! drop it when the request ends. Every mutation must call the matching
//! `forget_*` method so later reads in the same scope see fresh rows.

use std::{collections::HashMap, sync::Mutex};

use crate::models::{bucket::Bucket, object::Object};

#[derive(Debug, Default)]
pub struct RequestCache {
    objects: Mutex<HashMap<String, Object>>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

/// Which table an object lookup targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Location {
    Live,
    Trash,
}

impl Location {
    fn prefix(&self) -> &'static str {
        match self {
            Location::Live => "live",
            Location::Trash => "trash",
        }
    }
}

impl RequestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Key covering both the lookup value and its bucket scope, so equal
    /// filenames in different buckets never share an entry.
    pub fn object_key(location: Location, id_or_filename: &str, bucket: Option<&str>) -> String {
        format!(
            "{}:{}@{}",
            location.prefix(),
            id_or_filename,
            bucket.unwrap_or("*")
        )
    }

    pub fn object(&self, key: &str) -> Option<Object> {
        self.objects.lock().ok()?.get(key).cloned()
    }

    pub fn remember_object(&self, key: String, object: &Object) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key, object.clone());
        }
    }

    /// Drop every cached entry for the object, whatever key it was found under.
    pub fn forget_object(&self, id: i64) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.retain(|_, cached| cached.id != id);
        }
    }

    pub fn bucket(&self, id_or_slug: &str) -> Option<Bucket> {
        self.buckets.lock().ok()?.get(id_or_slug).cloned()
    }

    pub fn remember_bucket(&self, bucket: &Bucket) {
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.insert(bucket.id.to_string(), bucket.clone());
            buckets.insert(bucket.slug.clone(), bucket.clone());
        }
    }

    pub fn forget_bucket(&self, id: i64) {
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.retain(|_, cached| cached.id != id);
        }
        if let Ok(mut objects) = self.objects.lock() {
            objects.retain(|_, cached| cached.bucket.id != id);
        }
    }
}
