use oci_depot::{Error, Reference, Repository};

mod common;

use common::{blobs::Blob, distributor, registry::start_registry};

fn reference(s: &str) -> Reference {
    Reference::parse(s).unwrap()
}

#[test]
fn pull_and_push_to_another_registry() {
    let root = tempfile::tempdir().unwrap();
    let source = start_registry();
    let mirror = start_registry();

    let config = Blob::config(r#"{"test": true}"#);
    let layers = [Blob::layer("first layer"), Blob::layer("second layer")];
    let digest = source.add_image("foo/bar", "0.1", &config, &layers);

    let distributor = distributor(root.path());

    let pulled = distributor
        .pull(&reference(&format!("{}/foo/bar:0.1", source.host())))
        .expect("Pull image");

    assert_eq!(pulled.digest, digest);

    for blob in [&config, &layers[0], &layers[1]] {
        let data = distributor.store().read_to_vec(&blob.digest).unwrap();
        assert_eq!(data, blob.data);
    }

    // Copy the image to the mirror.
    let target = reference(&format!("{}/mirror/bar:latest", mirror.host()));

    distributor
        .tag(
            &reference(&format!("{}/foo/bar:0.1", source.host())),
            &target,
        )
        .unwrap();

    let pushed = distributor.push(&target).expect("Push image");
    assert_eq!(pushed, digest);

    for blob in [&config, &layers[0], &layers[1]] {
        assert!(mirror.has_blob(&blob.digest));
    }

    assert_eq!(
        mirror.manifest("mirror/bar", "latest"),
        source.manifest("foo/bar", "0.1")
    );

    assert_eq!(mirror.requests("POST /v2/mirror/bar/blobs/uploads/"), 3);

    // Second push. Blobs are not uploaded again.
    distributor.push(&target).unwrap();
    assert_eq!(mirror.requests("POST "), 3);
}

#[test]
fn retry_unavailable_registry() {
    let root = tempfile::tempdir().unwrap();
    let registry = start_registry();

    let config = Blob::config("{}");
    let layer = Blob::layer("data");
    registry.add_image("foo/bar", "1", &config, &[layer.clone()]);

    let distributor = distributor(root.path());
    let image = reference(&format!("{}/foo/bar:1", registry.host()));

    registry.set_unavailable(2);
    distributor.pull(&image).expect("Pull after 503 responses");
    assert!(distributor.store().exists(&layer.digest));

    distributor.delete(&image, false).unwrap();
    assert!(!distributor.store().exists(&layer.digest));

    registry.set_unavailable(100);
    match distributor.pull(&image) {
        Err(Error::RetriesExhausted { attempts: 3, last }) => {
            assert!(matches!(*last, Error::TransientTransport { .. }));
        }

        other => panic!("Unexpected result: {other:?}"),
    }

    assert!(distributor.repositories().is_empty());
}

#[test]
fn reject_tampered_layer() {
    let root = tempfile::tempdir().unwrap();
    let registry = start_registry();

    let config = Blob::config("{}");
    let layer = Blob::layer("original");
    let digest = registry.add_image("foo/bar", "1", &config, &[layer.clone()]);

    registry.tamper(&layer.digest, b"modified");

    let distributor = distributor(root.path());
    let image = reference(&format!("{}/foo/bar@{digest}", registry.host()));

    match distributor.pull(&image) {
        Err(Error::LayerVerificationFailed {
            expected, actual, ..
        }) => {
            assert_eq!(expected, layer.digest);
            assert_eq!(actual, Blob::layer("modified").digest);
        }

        other => panic!("Unexpected result: {other:?}"),
    }

    assert!(matches!(distributor.resolve(&image), Err(Error::NotFound(_))));
    assert!(!distributor.store().exists(&layer.digest));
}

#[test]
fn index_is_persisted() {
    let root = tempfile::tempdir().unwrap();
    let registry = start_registry();

    let base = Blob::layer("base");
    registry.add_image(
        "foo/a",
        "1",
        &Blob::config(r#"{"image": "a"}"#),
        &[base.clone(), Blob::layer("a")],
    );

    registry.add_image(
        "foo/b",
        "1",
        &Blob::config(r#"{"image": "b"}"#),
        &[base.clone(), Blob::layer("b")],
    );

    let image_a = reference(&format!("{}/foo/a:1", registry.host()));
    let image_b = reference(&format!("{}/foo/b:1", registry.host()));

    {
        let distributor = distributor(root.path());
        distributor.pull(&image_a).unwrap();
        distributor.pull(&image_b).unwrap();
    }

    // Shared blobs are downloaded once.
    let base_url = format!("GET /v2/foo/b/blobs/{}", base.digest);
    assert_eq!(registry.requests(&base_url), 0);

    let distributor = distributor(root.path());

    let mut repositories = distributor.repositories();
    repositories.sort();
    assert_eq!(
        repositories,
        [image_a.repository.clone(), image_b.repository.clone()]
    );

    distributor.delete(&image_a, false).unwrap();
    assert!(distributor.store().exists(&base.digest));
    assert!(!distributor.store().exists(&Blob::layer("a").digest));

    let entries = distributor.list(&image_b.repository);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].tag.as_deref(), Some("1"));

    let other: Repository = format!("{}/foo/a", registry.host()).parse().unwrap();
    assert!(distributor.list(&other).is_empty());
}
