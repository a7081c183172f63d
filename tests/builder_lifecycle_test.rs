//! Lifecycle tests for standalone and embedded meter provider builds.

use meter_provider_builder::opentelemetry_sdk::error::{OTelSdkError, OTelSdkResult};
use meter_provider_builder::{
    CompositeMetricReader, DeferredCallback, MeterProvider, MeterProviderBuilder,
    MeterProviderError, MetricReader, MetricsServiceCollectionExt, ResourceBuilder, Service,
    ServiceCollection, ServiceProvider, meter_provider_builder,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Default)]
struct MyInstrumentation {
    disposals: AtomicUsize,
}

impl Service for MyInstrumentation {
    fn dispose(&self) {
        self.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MyReader {
    collects: AtomicUsize,
}

impl Service for MyReader {}

impl MetricReader for MyReader {
    fn collect(&self) -> OTelSdkResult {
        self.collects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> OTelSdkResult {
        Ok(())
    }
}

struct FailingReader;

impl Service for FailingReader {}

impl MetricReader for FailingReader {
    fn collect(&self) -> OTelSdkResult {
        Err(OTelSdkError::InternalFailure("collector offline".to_string()))
    }

    fn shutdown(&self) -> OTelSdkResult {
        Ok(())
    }
}

#[derive(Default)]
struct Unrelated;

impl Service for Unrelated {}

struct Lifecycle {
    configure_services_called: bool,
    configure_builder_invocations: Arc<AtomicUsize>,
}

/// Registers a meter, a reader and an instrumentation through the service
/// container, plus three nested deferred callbacks.
fn configure_lifecycle(builder: &mut MeterProviderBuilder) -> Lifecycle {
    assert_eq!(builder.state().pending_callbacks(), 0);

    builder.add_meter("TestSource").unwrap();

    let mut configure_services_called = false;
    builder
        .configure_services(|services| {
            configure_services_called = true;
            services.try_add_singleton::<MyReader>();
            services.configure_metrics(|b| {
                b.add_instrumentation_service::<MyInstrumentation>()?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&invocations);
    builder
        .configure_builder(move |services, builder| {
            counter.fetch_add(1, Ordering::SeqCst);
            assert!(builder.is_resolved());

            builder.add_meter("TestSource2")?;
            assert!(builder.state().contains_meter("TestSource"));
            assert!(builder.state().contains_meter("TestSource2"));

            assert!(matches!(
                builder.configure_services(|s| {
                    s.try_add_singleton::<Unrelated>();
                    Ok(())
                }),
                Err(MeterProviderError::Unsupported(_))
            ));

            builder.add_shared_reader(services.get_required_service::<MyReader>()?)?;

            let counter = Arc::clone(&counter);
            builder.configure_builder(move |_, b| {
                counter.fetch_add(1, Ordering::SeqCst);

                let counter = Arc::clone(&counter);
                b.configure_builder(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    Lifecycle {
        configure_services_called,
        configure_builder_invocations: invocations,
    }
}

fn verify_lifecycle(lifecycle: &Lifecycle, provider: &MeterProvider) {
    assert!(lifecycle.configure_services_called);
    assert_eq!(
        lifecycle.configure_builder_invocations.load(Ordering::SeqCst),
        3
    );

    assert_eq!(provider.instrumentations().len(), 1);
    assert!(provider.instrumentations()[0].is::<MyInstrumentation>());
    assert!(provider.reader().is_some_and(|r| r.is::<MyReader>()));
    assert!(provider.is_meter_enabled("TestSource"));
    assert!(provider.is_meter_enabled("TestSource2"));
}

#[test]
fn service_lifecycle_available_to_standalone_builder() {
    let mut builder = meter_provider_builder();
    builder
        .configure_services(|services| {
            services.try_add_singleton::<MyInstrumentation>();
            Ok(())
        })
        .unwrap();

    let lifecycle = configure_lifecycle(&mut builder);
    let provider = builder.build().unwrap();

    assert!(matches!(
        builder.build(),
        Err(MeterProviderError::Unsupported(_))
    ));

    verify_lifecycle(&lifecycle, &provider);

    let owned = provider.owned_service_provider().unwrap();
    let instrumentation = owned.get_required_service::<MyInstrumentation>().unwrap();
    let registered = provider.instrumentations()[0]
        .downcast_ref::<MyInstrumentation>()
        .unwrap();
    assert!(std::ptr::eq(instrumentation.as_ref(), registered));
    assert_eq!(instrumentation.disposals.load(Ordering::SeqCst), 0);

    provider.dispose();

    assert!(provider.is_disposed());
    assert_eq!(instrumentation.disposals.load(Ordering::SeqCst), 1);

    drop(provider);
    assert_eq!(instrumentation.disposals.load(Ordering::SeqCst), 1);
}

#[test]
fn service_lifecycle_available_to_embedded_builder() {
    let mut services = ServiceCollection::new();
    let mut lifecycle = None;

    services
        .configure_metrics(|builder| {
            assert!(builder.is_embedded());
            lifecycle = Some(configure_lifecycle(builder));

            assert!(matches!(
                builder.build(),
                Err(MeterProviderError::Unsupported(_))
            ));
            Ok(())
        })
        .unwrap();

    let lifecycle = lifecycle.unwrap();
    let service_provider = services.build_service_provider();
    let provider = service_provider
        .get_required_service::<MeterProvider>()
        .unwrap();

    verify_lifecycle(&lifecycle, &provider);
    assert!(provider.owned_service_provider().is_none());
    assert!(!provider.is_disposed());

    let instrumentation = service_provider
        .get_required_service::<MyInstrumentation>()
        .unwrap();

    service_provider.dispose();

    assert!(provider.is_disposed());
    assert_eq!(instrumentation.disposals.load(Ordering::SeqCst), 1);

    drop(provider);
    drop(service_provider);
    assert_eq!(instrumentation.disposals.load(Ordering::SeqCst), 1);
}

#[test]
fn single_provider_for_service_collection() {
    let mut services = ServiceCollection::new();

    services
        .configure_metrics(|builder| {
            builder.add_instrumentation(MyInstrumentation::default)?;
            Ok(())
        })
        .unwrap();
    services
        .configure_metrics(|builder| {
            builder.add_instrumentation(MyInstrumentation::default)?;
            Ok(())
        })
        .unwrap();

    let service_provider = services.build_service_provider();
    let providers = service_provider.get_services::<MeterProvider>().unwrap();

    assert_eq!(providers.len(), 1);
    assert_eq!(providers[0].instrumentations().len(), 2);
}

#[test]
fn add_reader_using_dependency_injection() {
    let mut builder = MeterProviderBuilder::new();
    builder
        .add_reader_service::<MyReader>()
        .unwrap()
        .add_reader_service::<MyReader>()
        .unwrap();

    let provider = builder.build().unwrap();

    let readers = provider
        .owned_service_provider()
        .unwrap()
        .get_services::<MyReader>()
        .unwrap();
    assert_eq!(readers.len(), 1);

    let composite = provider
        .reader()
        .and_then(|r| r.downcast_ref::<CompositeMetricReader>())
        .unwrap();
    assert_eq!(composite.len(), 2);
    assert!(composite.head().value().is::<MyReader>());
    assert!(
        composite
            .head()
            .next()
            .is_some_and(|n| n.value().is::<MyReader>())
    );

    provider.collect().unwrap();
    assert_eq!(readers[0].collects.load(Ordering::SeqCst), 2);
}

#[test]
fn set_and_configure_resource() {
    let mut builder = MeterProviderBuilder::new();
    let invocations = Arc::new(AtomicUsize::new(0));

    let mut initial = ResourceBuilder::new();
    initial.add_service("Test");

    let first = Arc::clone(&invocations);
    let second = Arc::clone(&invocations);
    builder
        .set_resource_builder(initial)
        .unwrap()
        .configure_resource(move |r| {
            first.fetch_add(1, Ordering::SeqCst);
            assert_eq!(r.len(), 1);
            r.add_attribute("key1", "value1");
            assert_eq!(r.len(), 2);
        })
        .unwrap()
        .set_resource_builder(ResourceBuilder::new())
        .unwrap()
        .configure_resource(move |r| {
            second.fetch_add(1, Ordering::SeqCst);
            assert!(r.is_empty());
            r.add_attribute("key2", "value2");
            assert_eq!(r.len(), 1);
        })
        .unwrap();

    let provider = builder.build().unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    let attributes: Vec<_> = provider
        .resource()
        .iter()
        .map(|(k, v)| (k.as_str().to_owned(), v.to_string()))
        .collect();
    assert_eq!(attributes, vec![("key2".to_string(), "value2".to_string())]);
}

#[test]
fn resource_is_empty_by_default() {
    let provider = MeterProviderBuilder::new().build().unwrap();

    assert!(provider.resource().is_empty());
    assert!(provider.reader().is_none());
    assert!(provider.instrumentations().is_empty());
}

#[test]
fn nested_callbacks_terminate_after_every_level() {
    fn nest(depth: usize, counter: Arc<AtomicUsize>) -> DeferredCallback {
        Box::new(
            move |_: &ServiceProvider, builder: &mut MeterProviderBuilder| {
                counter.fetch_add(1, Ordering::SeqCst);
                if depth > 0 {
                    builder.configure_builder(nest(depth - 1, counter))?;
                }
                Ok(())
            },
        )
    }

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut builder = MeterProviderBuilder::new();
    builder
        .configure_builder(nest(10, Arc::clone(&invocations)))
        .unwrap();

    let _provider = builder.build().unwrap();

    assert_eq!(invocations.load(Ordering::SeqCst), 11);
}

#[test]
fn callbacks_queued_during_drain_run_after_existing_ones() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut builder = MeterProviderBuilder::new();

    let a = Arc::clone(&log);
    builder
        .configure_builder(move |_, builder| {
            a.lock().push("a");
            let c = Arc::clone(&a);
            builder.configure_builder(move |_, _| {
                c.lock().push("c");
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    let b = Arc::clone(&log);
    builder
        .configure_builder(move |_, _| {
            b.lock().push("b");
            Ok(())
        })
        .unwrap();

    let _provider = builder.build().unwrap();

    assert_eq!(*log.lock(), vec!["a", "b", "c"]);
}

#[test]
fn callback_failure_aborts_build() {
    let later_ran = Arc::new(AtomicBool::new(false));
    let mut builder = MeterProviderBuilder::new();
    builder
        .configure_services(|services| {
            services.try_add_singleton::<MyInstrumentation>();
            Ok(())
        })
        .unwrap();

    let captured = Arc::new(parking_lot::Mutex::new(None));
    let slot = Arc::clone(&captured);
    builder
        .configure_builder(move |services, _| {
            *slot.lock() = Some(services.get_required_service::<MyInstrumentation>()?);
            Err(MeterProviderError::callback("configuration rejected"))
        })
        .unwrap();

    let flag = Arc::clone(&later_ran);
    builder
        .configure_builder(move |_, _| {
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let result = builder.build();

    assert!(matches!(result, Err(MeterProviderError::Callback(_))));
    assert!(!later_ran.load(Ordering::SeqCst));

    let instrumentation = captured.lock().take().unwrap();
    assert_eq!(instrumentation.disposals.load(Ordering::SeqCst), 1);

    assert!(matches!(
        builder.build(),
        Err(MeterProviderError::Unsupported(_))
    ));
}

#[test]
fn missing_reader_service_fails_build() {
    let mut builder = MeterProviderBuilder::new();
    builder
        .configure_builder(|_, builder| {
            builder.add_reader_service::<MyReader>()?;
            Ok(())
        })
        .unwrap();

    assert!(matches!(
        builder.build(),
        Err(MeterProviderError::MissingService { .. })
    ));
}

#[test]
fn composite_reader_visits_every_reader_despite_failures() {
    let healthy = Arc::new(MyReader::default());
    let mut builder = MeterProviderBuilder::new();
    builder
        .add_reader(FailingReader)
        .unwrap()
        .add_shared_reader(healthy.clone())
        .unwrap();

    let provider = builder.build().unwrap();

    assert!(matches!(
        provider.collect(),
        Err(OTelSdkError::InternalFailure(ref m)) if m == "collector offline"
    ));
    assert_eq!(healthy.collects.load(Ordering::SeqCst), 1);
}

#[test]
fn embedded_configuration_is_consumed_by_standalone_build() {
    let mut builder = MeterProviderBuilder::new();
    builder
        .configure_services(|services| {
            services.configure_metrics(|b| {
                b.add_meter("nested")?;
                Ok(())
            })?;
            Ok(())
        })
        .unwrap();

    let provider = builder.build().unwrap();
    assert!(provider.is_meter_enabled("nested"));

    let owned = provider.owned_service_provider().unwrap();
    assert!(matches!(
        owned.get_service::<MeterProvider>(),
        Err(MeterProviderError::InvalidState(_))
    ));
}

#[test]
fn builders_are_independent() {
    let mut first = meter_provider_builder();
    let second = meter_provider_builder();

    first.add_meter("only-first").unwrap();

    assert_eq!(first.meter_sources(), ["only-first"]);
    assert!(second.meter_sources().is_empty());
}

#[test]
fn same_reader_instance_registered_twice_yields_two_entries() {
    let reader = Arc::new(MyReader::default());
    let mut builder = MeterProviderBuilder::new();
    builder
        .add_shared_reader(reader.clone())
        .unwrap()
        .add_shared_reader(reader.clone())
        .unwrap();

    let provider = builder.build().unwrap();
    let composite = provider
        .reader()
        .and_then(|r| r.downcast_ref::<CompositeMetricReader>())
        .unwrap();

    assert_eq!(composite.len(), 2);
    assert!(composite.iter().all(|r| r.is::<MyReader>()));

    provider.collect().unwrap();
    assert_eq!(reader.collects.load(Ordering::SeqCst), 2);
}

#[derive(Default)]
struct FlushFailingReader {
    shutdowns: AtomicUsize,
}

impl Service for FlushFailingReader {}

impl MetricReader for FlushFailingReader {
    fn collect(&self) -> OTelSdkResult {
        Ok(())
    }

    fn force_flush(&self) -> OTelSdkResult {
        Err(OTelSdkError::InternalFailure("flush rejected".to_string()))
    }

    fn shutdown(&self) -> OTelSdkResult {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn dispose_shuts_down_reader_whose_flush_fails() {
    let reader = Arc::new(FlushFailingReader::default());
    let mut builder = MeterProviderBuilder::new();
    builder.add_shared_reader(reader.clone()).unwrap();

    let provider = builder.build().unwrap();
    provider.dispose();

    assert!(provider.is_disposed());
    assert_eq!(reader.shutdowns.load(Ordering::SeqCst), 1);
}

#[test]
fn failed_flush_does_not_stop_composite_shutdown() {
    let first = Arc::new(FlushFailingReader::default());
    let second = Arc::new(FlushFailingReader::default());
    let mut builder = MeterProviderBuilder::new();
    builder
        .add_shared_reader(first.clone())
        .unwrap()
        .add_shared_reader(second.clone())
        .unwrap();

    let provider = builder.build().unwrap();

    assert!(matches!(
        provider.shutdown(),
        Err(MeterProviderError::Shutdown(OTelSdkError::InternalFailure(_)))
    ));
    assert_eq!(first.shutdowns.load(Ordering::SeqCst), 1);
    assert_eq!(second.shutdowns.load(Ordering::SeqCst), 1);

    drop(provider);
    assert_eq!(first.shutdowns.load(Ordering::SeqCst), 1);
}
