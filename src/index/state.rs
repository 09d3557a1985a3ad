//! In-memory state of the reference index.
//!
//! Every mutation is applied to a copy of the state, which replaces the
//! current one only if the whole mutation succeeds.

use std::{
    collections::{BTreeMap, BTreeSet},
    mem,
};

use crate::{
    digest::Digest,
    error::Error,
    reference::{Reference, Repository},
};

use super::{ImageId, ImageRecord, ListEntry, Removal};

#[derive(Clone, Debug, Default, serde::Deserialize, serde::Serialize)]
pub(super) struct State {
    /// Image records, by the manifest (or image index) digest that
    /// selects them.
    ///
    /// Different manifests can share the same configuration, so an image
    /// may have more than one record.
    manifests: BTreeMap<Digest, ImageRecord>,

    /// Tag associations.
    tags: BTreeMap<Repository, BTreeMap<String, Digest>>,

    /// Digest associations.
    digests: BTreeMap<Repository, BTreeMap<Digest, ImageId>>,

    /// Number of associations for each image.
    #[serde(skip)]
    refcounts: BTreeMap<ImageId, usize>,

    /// Blobs used by in-flight operations.
    #[serde(skip)]
    pub(super) leases: BTreeMap<Digest, usize>,

    /// Blobs released by purged images, pending to be removed from
    /// the blob store.
    #[serde(skip)]
    pub(super) collecting: BTreeSet<Digest>,

    /// Blobs released while they were leased. They are collected when
    /// the last lease is dropped, if no image uses them.
    #[serde(skip)]
    deferred: BTreeSet<Digest>,
}

type Result<T> = std::result::Result<T, Error>;

impl State {
    /// Compute the reference counts after loading the state from disk.
    pub fn rebuild_refcounts(&mut self) {
        let mut refcounts = BTreeMap::new();

        let tagged = self.tags.values().flat_map(|t| t.values());
        for record in tagged.filter_map(|d| self.manifests.get(d)) {
            *refcounts.entry(record.id.clone()).or_default() += 1;
        }

        for image in self.digests.values().flat_map(|d| d.values()) {
            *refcounts.entry(image.clone()).or_default() += 1;
        }

        self.refcounts = refcounts;
    }

    /// Copy the blobs reserved by a pending commit on `pending`.
    ///
    /// Leases on those blobs wait until the commit is finished.
    pub fn reserve(&mut self, pending: &State) {
        self.collecting.clone_from(&pending.collecting);
    }

    /// Take the data of in-flight operations from `live`, which is the
    /// state replaced by this one.
    pub fn adopt_runtime(&mut self, live: &mut State) {
        self.leases = mem::take(&mut live.leases);
        self.collecting = mem::take(&mut live.collecting);
    }

    /// Record of an image, from its own manifest.
    pub fn image(&self, id: &ImageId) -> Option<&ImageRecord> {
        self.images().find(|r| r.id == *id)
    }

    /// Records of every image manifest.
    pub fn images(&self) -> impl Iterator<Item = &ImageRecord> {
        self.manifests
            .iter()
            .filter(|(digest, record)| **digest == record.manifest)
            .map(|(_, record)| record)
    }

    pub fn refcount(&self, id: &ImageId) -> usize {
        self.refcounts.get(id).copied().unwrap_or(0)
    }

    fn image_of(&self, digest: &Digest) -> Result<&ImageId> {
        self.manifests
            .get(digest)
            .map(|r| &r.id)
            .ok_or_else(|| Error::NotFound(format!("manifest {digest}")))
    }

    /// `true` if a record uses the blob.
    fn in_use(&self, blob: &Digest) -> bool {
        self.manifests
            .iter()
            .any(|(digest, record)| digest == blob || record.blobs().any(|b| b == blob))
    }

    /// Add an image record, reachable from the manifest `digest`.
    ///
    /// `digest` is either the image manifest, or the image index that
    /// selected it. The blobs of the record must be present in the blob
    /// store. Blobs that are being collected are rejected.
    pub fn register(&mut self, digest: &Digest, record: ImageRecord) -> Result<()> {
        if let Some(blob) = record.blobs().find(|b| self.collecting.contains(*b)) {
            return Err(Error::IndexConflict(format!(
                "blob {blob} of image {} was removed",
                record.id
            )));
        }

        for key in [digest, &record.manifest] {
            match self.manifests.get(key) {
                Some(existing) if *existing != record => {
                    return Err(Error::IndexConflict(format!(
                        "manifest {key} is already associated with image {}",
                        existing.id
                    )));
                }

                _ => (),
            }
        }

        self.manifests.insert(digest.clone(), record.clone());
        self.manifests.insert(record.manifest.clone(), record);

        Ok(())
    }

    /// Point a tag to a manifest digest, replacing any previous value.
    pub fn set_tag(
        &mut self,
        repository: &Repository,
        tag: &str,
        digest: &Digest,
        removal: &mut Removal,
    ) -> Result<()> {
        let image = self.image_of(digest)?.clone();

        let previous = self
            .tags
            .entry(repository.clone())
            .or_default()
            .insert(tag.to_owned(), digest.clone());

        if previous.as_ref() == Some(digest) {
            return Ok(());
        }

        self.incref(&image);

        if let Some(previous) = previous {
            if let Some(old_image) = self.manifests.get(&previous).map(|r| r.id.clone()) {
                self.decref(&old_image, removal);
            }
        }

        Ok(())
    }

    /// Add a digest association. Nothing is changed if it already exists.
    pub fn add_digest(&mut self, repository: &Repository, digest: &Digest) -> Result<()> {
        let image = self.image_of(digest)?.clone();

        let digests = self.digests.entry(repository.clone()).or_default();
        if digests.contains_key(digest) {
            return Ok(());
        }

        digests.insert(digest.clone(), image.clone());
        self.incref(&image);

        Ok(())
    }

    pub fn remove_tag(
        &mut self,
        repository: &Repository,
        tag: &str,
        removal: &mut Removal,
    ) -> Result<Digest> {
        let digest = self
            .tags
            .get_mut(repository)
            .and_then(|tags| tags.remove(tag))
            .ok_or_else(|| Error::NotFound(format!("{repository}:{tag}")))?;

        self.prune_repository(repository);

        let reference = Reference::with_tag(repository.clone(), tag)?;
        removal.untagged.push(reference);

        if let Some(image) = self.manifests.get(&digest).map(|r| r.id.clone()) {
            self.decref(&image, removal);
        }

        Ok(digest)
    }

    /// Tags in `repository` that point to `digest`.
    pub fn tags_for(&self, repository: &Repository, digest: &Digest) -> Vec<String> {
        self.tags
            .get(repository)
            .into_iter()
            .flatten()
            .filter(|(_, d)| *d == digest)
            .map(|(t, _)| t.clone())
            .collect()
    }

    /// Remove a digest association.
    ///
    /// It fails with [`Error::InUse`] if a tag in the same repository
    /// still points to the digest.
    pub fn remove_digest(
        &mut self,
        repository: &Repository,
        digest: &Digest,
        removal: &mut Removal,
    ) -> Result<()> {
        let tags = self.tags_for(repository, digest);
        if !tags.is_empty() {
            return Err(Error::InUse {
                reference: format!("{repository}@{digest}"),
                holders: tags.iter().map(|t| format!("{repository}:{t}")).collect(),
            });
        }

        let image = self
            .digests
            .get_mut(repository)
            .and_then(|d| d.remove(digest))
            .ok_or_else(|| Error::NotFound(format!("{repository}@{digest}")))?;

        self.prune_repository(repository);

        removal
            .untagged
            .push(Reference::with_digest(repository.clone(), digest.clone()));

        self.decref(&image, removal);

        Ok(())
    }

    /// Remove the digest associations in `repository` for `image`.
    pub fn remove_digests_of(
        &mut self,
        repository: &Repository,
        image: &ImageId,
        removal: &mut Removal,
    ) -> Result<()> {
        let digests: Vec<_> = self
            .digests
            .get(repository)
            .into_iter()
            .flatten()
            .filter(|(_, i)| *i == image)
            .map(|(d, _)| d.clone())
            .collect();

        for digest in digests {
            self.remove_digest(repository, &digest, removal)?;
        }

        Ok(())
    }

    /// Delete a reference, like `docker rmi` does.
    ///
    /// A tag is removed alone, unless it was the last tag in the repository
    /// for its image; in that case, the digest associations of the
    /// repository to the same image are removed too.
    ///
    /// A digest is in use while a tag in the repository points to it. With
    /// `force`, those tags are removed with the digest.
    pub fn delete_reference(
        &mut self,
        reference: &Reference,
        force: bool,
        removal: &mut Removal,
    ) -> Result<()> {
        let repository = &reference.repository;

        match (&reference.tag, &reference.digest) {
            (Some(tag), _) => {
                let image = self.resolve(reference)?.1.id.clone();

                self.remove_tag(repository, tag, removal)?;

                let tagged = self
                    .tags
                    .get(repository)
                    .into_iter()
                    .flatten()
                    .any(|(_, d)| self.manifests.get(d).is_some_and(|r| r.id == image));

                if !tagged {
                    self.remove_digests_of(repository, &image, removal)?;
                }

                Ok(())
            }

            (None, Some(digest)) => {
                let tags = self.tags_for(repository, digest);
                if !tags.is_empty() && !force {
                    return Err(Error::InUse {
                        reference: reference.to_string(),
                        holders: tags.iter().map(|t| format!("{repository}:{t}")).collect(),
                    });
                }

                let associated = self
                    .digests
                    .get(repository)
                    .is_some_and(|d| d.contains_key(digest));

                if !associated && tags.is_empty() {
                    return Err(Error::NotFound(reference.to_string()));
                }

                for tag in tags {
                    self.remove_tag(repository, &tag, removal)?;
                }

                if associated {
                    self.remove_digest(repository, digest, removal)?;
                }

                Ok(())
            }

            (None, None) => Err(Error::NotFound(reference.to_string())),
        }
    }

    /// Find the manifest digest and the image record for a reference.
    pub fn resolve(&self, reference: &Reference) -> Result<(Digest, &ImageRecord)> {
        let not_found = || Error::NotFound(reference.to_string());
        let repository = &reference.repository;

        let digest = match (&reference.tag, &reference.digest) {
            (Some(tag), expected) => {
                let digest = self
                    .tags
                    .get(repository)
                    .and_then(|t| t.get(tag))
                    .ok_or_else(not_found)?;

                // A `tag@digest` reference is valid only if the tag
                // points to the same digest.
                if expected.as_ref().is_some_and(|e| e != digest) {
                    return Err(not_found());
                }

                digest
            }

            (None, Some(digest)) => {
                let associated = self
                    .digests
                    .get(repository)
                    .is_some_and(|d| d.contains_key(digest));

                if !associated && self.tags_for(repository, digest).is_empty() {
                    return Err(not_found());
                }

                digest
            }

            (None, None) => return Err(not_found()),
        };

        let record = self.manifests.get(digest).ok_or_else(not_found)?;
        Ok((digest.clone(), record))
    }

    /// All references (tags and digests) to an image.
    pub fn references(&self, image: &ImageId) -> Vec<Reference> {
        let mut references = Vec::new();

        for (repository, tags) in &self.tags {
            for (tag, digest) in tags {
                if self.manifests.get(digest).is_some_and(|r| r.id == *image) {
                    references.push(Reference {
                        repository: repository.clone(),
                        tag: Some(tag.clone()),
                        digest: None,
                    });
                }
            }
        }

        for (repository, digests) in &self.digests {
            for (digest, i) in digests {
                if i == image {
                    references.push(Reference::with_digest(repository.clone(), digest.clone()));
                }
            }
        }

        references
    }

    /// Remove an image, and all the references to it.
    pub fn delete_image(&mut self, image: &ImageId, force: bool, removal: &mut Removal) -> Result<()> {
        if self.image(image).is_none() {
            return Err(Error::NotFound(format!("image {image}")));
        }

        let references = self.references(image);
        if !references.is_empty() && !force {
            return Err(Error::InUse {
                reference: image.to_string(),
                holders: references.iter().map(|r| r.to_string()).collect(),
            });
        }

        for reference in references {
            let repository = &reference.repository;
            if let Some(tag) = &reference.tag {
                if let Some(tags) = self.tags.get_mut(repository) {
                    tags.remove(tag);
                }
            } else if let Some(digest) = &reference.digest {
                if let Some(digests) = self.digests.get_mut(repository) {
                    digests.remove(digest);
                }
            }

            self.prune_repository(repository);
            removal.untagged.push(reference);
        }

        self.refcounts.remove(image);
        self.purge(image, removal);

        Ok(())
    }

    pub fn list(&self, repository: &Repository) -> Vec<ListEntry> {
        let mut entries = Vec::new();

        for (tag, digest) in self.tags.get(repository).into_iter().flatten() {
            if let Some(record) = self.manifests.get(digest) {
                entries.push(ListEntry {
                    tag: Some(tag.clone()),
                    digest: digest.clone(),
                    image: record.id.clone(),
                });
            }
        }

        for (digest, image) in self.digests.get(repository).into_iter().flatten() {
            if self.tags_for(repository, digest).is_empty() {
                entries.push(ListEntry {
                    tag: None,
                    digest: digest.clone(),
                    image: image.clone(),
                });
            }
        }

        entries
    }

    pub fn repositories(&self) -> BTreeSet<&Repository> {
        self.tags.keys().chain(self.digests.keys()).collect()
    }

    /// Drop a lease on `digests`.
    ///
    /// Returns the blobs that were released while leased, and that can be
    /// collected now. They are marked as being collected.
    pub fn release_lease(&mut self, digests: &[Digest]) -> Vec<Digest> {
        let mut released = Vec::new();

        for digest in digests {
            let Some(count) = self.leases.get_mut(digest) else {
                continue;
            };

            *count -= 1;
            if *count > 0 {
                continue;
            }

            self.leases.remove(digest);

            if self.deferred.remove(digest)
                && !self.in_use(digest)
                && self.collecting.insert(digest.clone())
            {
                released.push(digest.clone());
            }
        }

        released
    }

    fn incref(&mut self, image: &ImageId) {
        *self.refcounts.entry(image.clone()).or_default() += 1;
    }

    fn decref(&mut self, image: &ImageId, removal: &mut Removal) {
        let count = self.refcounts.entry(image.clone()).or_default();
        *count = count.saturating_sub(1);

        if *count == 0 {
            self.refcounts.remove(image);
            self.purge(image, removal);
        }
    }

    /// Delete the records of an image with no references.
    ///
    /// Blobs used only by those records are added to `removal.blobs`,
    /// unless an in-flight operation leased them. Leased blobs are
    /// deferred until the lease is dropped.
    fn purge(&mut self, image: &ImageId, removal: &mut Removal) {
        let keys: Vec<Digest> = self
            .manifests
            .iter()
            .filter(|(_, r)| r.id == *image)
            .map(|(d, _)| d.clone())
            .collect();

        if keys.is_empty() {
            return;
        }

        let mut candidates = BTreeSet::new();
        for key in keys {
            if let Some(record) = self.manifests.remove(&key) {
                candidates.extend(record.blobs().cloned());
                candidates.insert(key);
            }
        }

        for blob in candidates {
            if self.in_use(&blob) {
                continue;
            }

            if self.leases.contains_key(&blob) {
                self.deferred.insert(blob);
            } else if self.collecting.insert(blob.clone()) {
                removal.blobs.push(blob);
            }
        }

        log::debug!("image {image} deleted");
        removal.deleted.push(image.clone());
    }

    fn prune_repository(&mut self, repository: &Repository) {
        if self.tags.get(repository).is_some_and(|t| t.is_empty()) {
            self.tags.remove(repository);
        }

        if self.digests.get(repository).is_some_and(|d| d.is_empty()) {
            self.digests.remove(repository);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn digest(data: &str) -> Digest {
        Digest::sha256(data.as_bytes())
    }

    fn repository(name: &str) -> Repository {
        Repository::from_str(name).unwrap()
    }

    /// Register an image with a single layer. Returns the manifest digest.
    fn register(state: &mut State, name: &str, layer: &str) -> Digest {
        let manifest = digest(&format!("manifest-{name}"));
        let record = ImageRecord {
            id: ImageId(digest(&format!("config-{name}"))),
            manifest: manifest.clone(),
            config: digest(&format!("config-{name}")),
            layers: vec![digest(layer)],
        };

        state.register(&manifest, record).unwrap();
        manifest
    }

    fn tags(state: &State, repository: &Repository) -> Vec<(Option<String>, Digest)> {
        state
            .list(repository)
            .into_iter()
            .map(|e| (e.tag, e.digest))
            .collect()
    }

    #[test]
    fn share_image_between_tags() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");

        let mut removal = Removal::default();
        state.set_tag(&repo, "latest", &d1, &mut removal).unwrap();
        state.set_tag(&repo, "stable", &d1, &mut removal).unwrap();
        assert!(removal.is_empty());

        assert_eq!(
            tags(&state, &repo),
            [
                (Some("latest".to_owned()), d1.clone()),
                (Some("stable".to_owned()), d1.clone()),
            ]
        );

        assert_eq!(state.images().count(), 1);

        // Remove one of the tags. The image is still available.
        state.remove_tag(&repo, "stable", &mut removal).unwrap();
        assert_eq!(tags(&state, &repo), [(Some("latest".to_owned()), d1.clone())]);
        assert!(removal.deleted.is_empty());

        // Remove the last tag. The image, and its blobs, are released.
        state.remove_tag(&repo, "latest", &mut removal).unwrap();
        assert!(tags(&state, &repo).is_empty());
        assert_eq!(state.images().count(), 0);
        assert_eq!(removal.deleted.len(), 1);
        assert!(removal.blobs.contains(&digest("L1")));
        assert!(removal.blobs.contains(&d1));
    }

    #[test]
    fn move_tag_releases_previous_image() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "shared");
        let d2 = register(&mut state, "2", "shared");

        let mut removal = Removal::default();
        state.set_tag(&repo, "latest", &d1, &mut removal).unwrap();
        state.set_tag(&repo, "latest", &d2, &mut removal).unwrap();

        assert_eq!(tags(&state, &repo), [(Some("latest".to_owned()), d2.clone())]);

        // The first image is deleted, but the shared layer is still in use.
        assert_eq!(removal.deleted, [ImageId(digest("config-1"))]);
        assert!(removal.blobs.contains(&d1));
        assert!(!removal.blobs.contains(&digest("shared")));
    }

    #[test]
    fn digest_associations() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");

        let mut removal = Removal::default();
        state.add_digest(&repo, &d1).unwrap();
        state.add_digest(&repo, &d1).unwrap();
        assert_eq!(state.refcount(&ImageId(digest("config-1"))), 1);

        assert_eq!(tags(&state, &repo), [(None, d1.clone())]);

        // A tag hides the `<none>` row.
        state.set_tag(&repo, "v1", &d1, &mut removal).unwrap();
        assert_eq!(tags(&state, &repo), [(Some("v1".to_owned()), d1.clone())]);

        // The digest can't be removed while the tag points to it.
        assert!(matches!(
            state.remove_digest(&repo, &d1, &mut removal),
            Err(Error::InUse { .. })
        ));

        state.remove_tag(&repo, "v1", &mut removal).unwrap();
        assert_eq!(tags(&state, &repo), [(None, d1.clone())]);
        assert!(removal.deleted.is_empty());

        state.remove_digest(&repo, &d1, &mut removal).unwrap();
        assert_eq!(removal.deleted.len(), 1);
    }

    #[test]
    fn resolve_references() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");
        let d2 = register(&mut state, "2", "L2");

        let mut removal = Removal::default();
        state.set_tag(&repo, "latest", &d1, &mut removal).unwrap();
        state.add_digest(&repo, &d2).unwrap();

        let resolve = |r: String| {
            state
                .resolve(&Reference::parse(&r).unwrap())
                .map(|(d, _)| d)
        };

        assert_eq!(resolve("foo/bar".into()).unwrap(), d1);
        assert_eq!(resolve(format!("foo/bar@{d1}")).unwrap(), d1);
        assert_eq!(resolve(format!("foo/bar@{d2}")).unwrap(), d2);
        assert_eq!(resolve(format!("foo/bar:latest@{d1}")).unwrap(), d1);

        for missing in [
            format!("foo/bar:latest@{d2}"),
            format!("foo/baz@{d1}"),
            "foo/bar:other".to_owned(),
        ] {
            assert!(matches!(resolve(missing), Err(Error::NotFound(_))));
        }
    }

    #[test]
    fn delete_image_by_id() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");
        let id = ImageId(digest("config-1"));

        let mut removal = Removal::default();
        state.set_tag(&repo, "a", &d1, &mut removal).unwrap();
        state.add_digest(&repository("other"), &d1).unwrap();

        match state.delete_image(&id, false, &mut removal) {
            Err(Error::InUse { holders, .. }) => assert_eq!(holders.len(), 2),
            other => panic!("Unexpected result: {other:?}"),
        }

        state.delete_image(&id, true, &mut removal).unwrap();
        assert_eq!(removal.untagged.len(), 2);
        assert_eq!(removal.deleted, [id]);
        assert!(state.repositories().is_empty());
    }

    #[test]
    fn delete_last_tag_removes_digests() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let other = repository("foo/other");
        let d1 = register(&mut state, "1", "L1");

        let mut removal = Removal::default();
        state.set_tag(&repo, "a", &d1, &mut removal).unwrap();
        state.set_tag(&repo, "b", &d1, &mut removal).unwrap();
        state.add_digest(&repo, &d1).unwrap();
        state.add_digest(&other, &d1).unwrap();

        let delete = |state: &mut State, r: String, force, removal: &mut Removal| {
            state.delete_reference(&Reference::parse(&r).unwrap(), force, removal)
        };

        // The digest is hidden by the tags.
        assert!(matches!(
            delete(&mut state, format!("foo/bar@{d1}"), false, &mut removal),
            Err(Error::InUse { .. })
        ));

        delete(&mut state, "foo/bar:a".into(), false, &mut removal).unwrap();
        assert_eq!(tags(&state, &repo), [(Some("b".to_owned()), d1.clone())]);

        // Last tag in the repository. The digest association goes too.
        delete(&mut state, "foo/bar:b".into(), false, &mut removal).unwrap();
        assert!(tags(&state, &repo).is_empty());

        // The image is still referenced from the other repository.
        assert!(removal.deleted.is_empty());
        assert_eq!(tags(&state, &other), [(None, d1.clone())]);

        delete(&mut state, format!("foo/other@{d1}"), false, &mut removal).unwrap();
        assert_eq!(removal.deleted.len(), 1);
    }

    #[test]
    fn force_delete_digest_with_tags() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");

        let mut removal = Removal::default();
        state.set_tag(&repo, "a", &d1, &mut removal).unwrap();

        let reference = Reference::with_digest(repo.clone(), d1.clone());
        state.delete_reference(&reference, true, &mut removal).unwrap();

        assert!(tags(&state, &repo).is_empty());
        assert_eq!(removal.deleted.len(), 1);

        assert!(matches!(
            state.delete_reference(&reference, true, &mut removal),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn leased_blobs_are_not_released() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");

        state.leases.insert(digest("L1"), 1);

        let mut removal = Removal::default();
        state.set_tag(&repo, "a", &d1, &mut removal).unwrap();
        state.remove_tag(&repo, "a", &mut removal).unwrap();

        assert!(!removal.blobs.contains(&digest("L1")));
        assert!(removal.blobs.contains(&d1));
    }

    #[test]
    fn reject_registration_of_collected_blobs() {
        let mut state = State::default();
        state.collecting.insert(digest("L1"));

        let manifest = digest("manifest");
        let record = ImageRecord {
            id: ImageId(digest("config")),
            manifest: manifest.clone(),
            config: digest("config"),
            layers: vec![digest("L1")],
        };

        assert!(matches!(
            state.register(&manifest, record),
            Err(Error::IndexConflict(_))
        ));
    }

    #[test]
    fn rebuild_refcounts_after_load() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");

        let mut removal = Removal::default();
        state.set_tag(&repo, "a", &d1, &mut removal).unwrap();
        state.set_tag(&repo, "b", &d1, &mut removal).unwrap();
        state.add_digest(&repo, &d1).unwrap();

        let json = serde_json::to_string(&state).unwrap();
        let mut loaded: State = serde_json::from_str(&json).unwrap();
        loaded.rebuild_refcounts();

        assert_eq!(loaded.refcount(&ImageId(digest("config-1"))), 3);
        assert_eq!(loaded.list(&repo).len(), 2);
    }

    #[test]
    fn manifests_with_the_same_config() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let config = digest("config");
        let id = ImageId(config.clone());

        let record = |manifest: &Digest, layer: &str| ImageRecord {
            id: id.clone(),
            manifest: manifest.clone(),
            config: config.clone(),
            layers: vec![digest(layer)],
        };

        let gzip = digest("manifest gzip");
        let zstd = digest("manifest zstd");
        state.register(&gzip, record(&gzip, "gzip")).unwrap();
        state.register(&zstd, record(&zstd, "zstd")).unwrap();

        let mut removal = Removal::default();
        state.set_tag(&repo, "gzip", &gzip, &mut removal).unwrap();
        state.set_tag(&repo, "zstd", &zstd, &mut removal).unwrap();

        let (resolved, found) = state
            .resolve(&Reference::parse("foo/bar:zstd").unwrap())
            .unwrap();

        assert_eq!(resolved, zstd);
        assert_eq!(found.manifest, zstd);
        assert_eq!(found.layers, [digest("zstd")]);
        assert_eq!(state.refcount(&id), 2);
        assert_eq!(state.images().count(), 2);

        state.remove_tag(&repo, "gzip", &mut removal).unwrap();
        assert!(removal.blobs.is_empty());

        // Blobs of both manifests are released with the image.
        state.remove_tag(&repo, "zstd", &mut removal).unwrap();

        let released: BTreeSet<_> = removal.blobs.iter().cloned().collect();
        let expected: BTreeSet<_> = [gzip, zstd, config, digest("gzip"), digest("zstd")]
            .into_iter()
            .collect();

        assert_eq!(released, expected);
        assert_eq!(removal.deleted, [id]);
    }

    #[test]
    fn release_deferred_blobs() {
        let mut state = State::default();
        let repo = repository("foo/bar");
        let d1 = register(&mut state, "1", "L1");

        state.leases.insert(digest("L1"), 2);

        let mut removal = Removal::default();
        state.set_tag(&repo, "a", &d1, &mut removal).unwrap();
        state.remove_tag(&repo, "a", &mut removal).unwrap();
        assert!(!removal.blobs.contains(&digest("L1")));

        assert!(state.release_lease(&[digest("L1")]).is_empty());
        assert_eq!(state.release_lease(&[digest("L1")]), [digest("L1")]);
        assert!(state.collecting.contains(&digest("L1")));

        // A deferred blob used by a new image is kept.
        state.collecting.clear();
        state.leases.insert(digest("L2"), 1);
        let d2 = register(&mut state, "2", "L2");
        state.set_tag(&repo, "b", &d2, &mut removal).unwrap();
        state.remove_tag(&repo, "b", &mut removal).unwrap();
        register(&mut state, "3", "L2");

        assert!(state.release_lease(&[digest("L2")]).is_empty());
        assert!(!state.collecting.contains(&digest("L2")));
    }
}
