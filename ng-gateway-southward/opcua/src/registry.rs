use arc_swap::ArcSwap;
use ng_gateway_sdk::{
    ChannelConfig, ChannelEvent, ChannelListener, ChannelRecord, DataType, ListenerKey,
};
use std::{
    collections::{hash_map::Entry, HashMap},
    fmt,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};

/// A caller's listener bound to an output record shape.
pub struct ListenRegistration {
    pub listener: Arc<dyn ChannelListener>,
    pub channel_name: Arc<str>,
    pub value_type: DataType,
    pub channel_config: Arc<ChannelConfig>,
}

impl ListenRegistration {
    pub fn new(
        listener: Arc<dyn ChannelListener>,
        channel_name: Arc<str>,
        value_type: DataType,
        channel_config: Arc<ChannelConfig>,
    ) -> Self {
        Self {
            listener,
            channel_name,
            value_type,
            channel_config,
        }
    }

    #[inline]
    pub fn listener_key(&self) -> ListenerKey {
        ListenerKey::of(&self.listener)
    }

    /// Same registration under a different channel name.
    pub fn renamed(&self, channel_name: Arc<str>) -> Self {
        Self {
            listener: Arc::clone(&self.listener),
            channel_name,
            value_type: self.value_type,
            channel_config: Arc::clone(&self.channel_config),
        }
    }

    #[inline]
    fn same_binding(&self, other: &ListenRegistration) -> bool {
        self.listener_key() == other.listener_key() && self.channel_name == other.channel_name
    }
}

impl fmt::Debug for ListenRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenRegistration")
            .field("listener", &self.listener_key())
            .field("channel_name", &self.channel_name)
            .field("value_type", &self.value_type)
            .finish()
    }
}

/// Notified after the set of registered params changes.
pub trait RegistryObserver: Send + Sync {
    fn on_registrations_changed(&self);
}

/// Params present in the registry but not active, and the other way round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryDiff<P> {
    pub create: Vec<P>,
    pub delete: Vec<P>,
}

/// Listen registrations keyed by params.
///
/// `generation` advances only when a key appears or empties out; `revision`
/// advances on every change and lets dispatchers refresh lazily.
pub struct ListenerRegistry<P> {
    inner: Mutex<RegistryInner<P>>,
    generation: AtomicU64,
    revision: AtomicU64,
}

struct RegistryInner<P> {
    entries: HashMap<P, Vec<Arc<ListenRegistration>>>,
    observers: Vec<Weak<dyn RegistryObserver>>,
}

impl<P> Default for ListenerRegistry<P> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                entries: HashMap::new(),
                observers: Vec::new(),
            }),
            generation: AtomicU64::new(0),
            revision: AtomicU64::new(0),
        }
    }
}

impl<P> ListenerRegistry<P>
where
    P: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, RegistryInner<P>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[inline]
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    #[inline]
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Add one registration. Returns whether the key set changed.
    pub fn register(&self, params: P, registration: Arc<ListenRegistration>) -> bool {
        self.register_all([(params, registration)])
    }

    /// Add a batch of registrations with at most one generation bump and one
    /// observer notification. A registration with the same listener and channel
    /// name as an existing one under the same params replaces it.
    pub fn register_all<I>(&self, batch: I) -> bool
    where
        I: IntoIterator<Item = (P, Arc<ListenRegistration>)>,
    {
        let observers = {
            let mut inner = self.lock();
            let mut changed = false;
            let mut key_set_changed = false;
            for (params, registration) in batch {
                let regs = match inner.entries.entry(params) {
                    Entry::Occupied(o) => o.into_mut(),
                    Entry::Vacant(v) => {
                        key_set_changed = true;
                        v.insert(Vec::new())
                    }
                };
                match regs.iter_mut().find(|r| r.same_binding(&registration)) {
                    Some(existing) => *existing = registration,
                    None => regs.push(registration),
                }
                changed = true;
            }
            self.commit(&mut inner, changed, key_set_changed)
        };
        Self::notify(observers)
    }

    /// Remove every registration of `listener`. Returns whether the key set changed.
    pub fn unregister(&self, listener: &Arc<dyn ChannelListener>) -> bool {
        let key = ListenerKey::of(listener);
        let observers = {
            let mut inner = self.lock();
            let mut changed = false;
            let mut key_set_changed = false;
            inner.entries.retain(|_, regs| {
                let before = regs.len();
                regs.retain(|r| r.listener_key() != key);
                changed |= regs.len() != before;
                if regs.is_empty() {
                    key_set_changed = true;
                    false
                } else {
                    true
                }
            });
            self.commit(&mut inner, changed, key_set_changed)
        };
        Self::notify(observers)
    }

    /// Bump counters under the lock and collect the observers to notify.
    fn commit(
        &self,
        inner: &mut RegistryInner<P>,
        changed: bool,
        key_set_changed: bool,
    ) -> Option<Vec<Arc<dyn RegistryObserver>>> {
        if changed {
            self.revision.fetch_add(1, Ordering::AcqRel);
        }
        if !key_set_changed {
            return None;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        inner.observers.retain(|o| o.strong_count() > 0);
        Some(inner.observers.iter().filter_map(Weak::upgrade).collect())
    }

    fn notify(observers: Option<Vec<Arc<dyn RegistryObserver>>>) -> bool {
        match observers {
            Some(observers) => {
                for observer in observers {
                    observer.on_registrations_changed();
                }
                true
            }
            None => false,
        }
    }

    pub fn add_observer(&self, observer: Weak<dyn RegistryObserver>) {
        self.lock().observers.push(observer);
    }

    pub fn remove_observer(&self, observer: &Weak<dyn RegistryObserver>) {
        self.lock()
            .observers
            .retain(|o| !Weak::ptr_eq(o, observer) && o.strong_count() > 0);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Number of distinct params.
    #[inline]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[inline]
    pub fn contains(&self, params: &P) -> bool {
        self.lock().entries.contains_key(params)
    }

    pub fn registrations(&self, params: &P) -> Vec<Arc<ListenRegistration>> {
        self.lock().entries.get(params).cloned().unwrap_or_default()
    }

    /// Copy of every entry.
    pub fn entries(&self) -> Vec<(P, Vec<Arc<ListenRegistration>>)> {
        self.lock()
            .entries
            .iter()
            .map(|(p, regs)| (p.clone(), regs.clone()))
            .collect()
    }

    /// Compare the registered params with the `active` set.
    pub fn diff<V>(&self, active: &HashMap<P, V>) -> RegistryDiff<P> {
        let inner = self.lock();
        let create = inner
            .entries
            .keys()
            .filter(|p| !active.contains_key(*p))
            .cloned()
            .collect();
        let delete = active
            .keys()
            .filter(|p| !inner.entries.contains_key(*p))
            .cloned()
            .collect();
        RegistryDiff { create, delete }
    }

    pub fn dispatcher(self: &Arc<Self>, params: P) -> Dispatcher<P> {
        Dispatcher {
            registry: Arc::downgrade(self),
            params,
            cache: ArcSwap::from_pointee(DispatchCache {
                revision: None,
                registrations: Vec::new(),
            }),
        }
    }
}

struct DispatchCache {
    revision: Option<u64>,
    registrations: Vec<Arc<ListenRegistration>>,
}

/// Fans samples of one params out to its registrations.
///
/// The registration snapshot is refreshed only when the registry revision moved.
pub struct Dispatcher<P> {
    registry: Weak<ListenerRegistry<P>>,
    params: P,
    cache: ArcSwap<DispatchCache>,
}

impl<P> Dispatcher<P>
where
    P: Clone + Eq + Hash + Send + Sync + 'static,
{
    #[inline]
    pub fn params(&self) -> &P {
        &self.params
    }

    /// Build one record per registration, let `fill` complete it and deliver it.
    /// Returns the number of listeners reached.
    pub fn dispatch<F>(&self, fill: F) -> usize
    where
        F: Fn(&mut ChannelRecord),
    {
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let current = registry.revision();
        let mut cache = self.cache.load_full();
        if cache.revision != Some(current) {
            let fresh = Arc::new(DispatchCache {
                revision: Some(current),
                registrations: registry.registrations(&self.params),
            });
            self.cache.store(Arc::clone(&fresh));
            cache = fresh;
        }
        for registration in cache.registrations.iter() {
            let mut record = ChannelRecord::from_shared(
                Arc::clone(&registration.channel_name),
                registration.value_type,
                Arc::clone(&registration.channel_config),
            );
            fill(&mut record);
            registration
                .listener
                .on_channel_event(ChannelEvent { record });
        }
        cache.registrations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ng_gateway_sdk::NGValue;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Collect(Mutex<Vec<ChannelRecord>>);

    impl ChannelListener for Collect {
        fn on_channel_event(&self, event: ChannelEvent) {
            self.0.lock().unwrap().push(event.record);
        }
    }

    struct CountingObserver {
        registry: Arc<ListenerRegistry<u32>>,
        calls: AtomicUsize,
        seen_len: AtomicUsize,
    }

    impl RegistryObserver for CountingObserver {
        fn on_registrations_changed(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Reads the registry from the callback, so the lock must be released.
            self.seen_len.store(self.registry.len(), Ordering::SeqCst);
        }
    }

    fn reg(listener: &Arc<dyn ChannelListener>, name: &str) -> Arc<ListenRegistration> {
        Arc::new(ListenRegistration::new(
            Arc::clone(listener),
            Arc::from(name),
            DataType::Int32,
            Arc::new(ChannelConfig::new()),
        ))
    }

    fn listener() -> Arc<dyn ChannelListener> {
        Arc::new(Collect::default())
    }

    #[test]
    fn test_generation_tracks_key_set_only() {
        let registry = ListenerRegistry::<u32>::new();
        let a = listener();
        let b = listener();

        assert!(registry.register(1, reg(&a, "a")));
        assert_eq!(registry.generation(), 1);
        assert!(!registry.register(1, reg(&b, "b")));
        assert_eq!(registry.generation(), 1);
        assert_eq!(registry.revision(), 2);

        // Same listener and channel name replaces the existing registration.
        registry.register(1, reg(&a, "a"));
        assert_eq!(registry.registrations(&1).len(), 2);

        assert!(!registry.unregister(&b));
        assert_eq!(registry.generation(), 1);
        assert!(registry.unregister(&a));
        assert_eq!(registry.generation(), 2);
        assert!(registry.is_empty());
        assert!(!registry.unregister(&a));
        assert_eq!(registry.generation(), 2);
    }

    #[test]
    fn test_register_all_bumps_once_and_notifies_outside_lock() {
        let registry = ListenerRegistry::<u32>::new();
        let observer = Arc::new(CountingObserver {
            registry: Arc::clone(&registry),
            calls: AtomicUsize::new(0),
            seen_len: AtomicUsize::new(0),
        });
        let weak: Weak<dyn RegistryObserver> = Arc::downgrade(&observer) as Weak<dyn RegistryObserver>;
        registry.add_observer(weak.clone());

        let a = listener();
        registry.register_all((1..=3).map(|p| (p, reg(&a, &p.to_string()))));
        assert_eq!(registry.generation(), 1);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.seen_len.load(Ordering::SeqCst), 3);

        registry.remove_observer(&weak);
        registry.unregister(&a);
        assert_eq!(observer.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_diff_against_active_set() {
        let registry = ListenerRegistry::<u32>::new();
        let a = listener();
        registry.register_all([(1, reg(&a, "1")), (2, reg(&a, "2"))]);
        let active: HashMap<u32, ()> = [(2, ()), (3, ())].into_iter().collect();
        let diff = registry.diff(&active);
        assert_eq!(diff.create, vec![1]);
        assert_eq!(diff.delete, vec![3]);
    }

    #[test]
    fn test_dispatcher_refreshes_on_revision() {
        let registry = ListenerRegistry::<u32>::new();
        let first = Arc::new(Collect::default());
        let second = Arc::new(Collect::default());
        let first_dyn: Arc<dyn ChannelListener> = first.clone();
        let second_dyn: Arc<dyn ChannelListener> = second.clone();

        registry.register(7, reg(&first_dyn, "one"));
        let dispatcher = registry.dispatcher(7);
        assert_eq!(dispatcher.dispatch(|r| r.value = Some(NGValue::Int32(1))), 1);

        registry.register(7, reg(&second_dyn, "two"));
        assert_eq!(dispatcher.dispatch(|r| r.value = Some(NGValue::Int32(2))), 2);

        let got = first.0.lock().unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(&*got[0].channel_name, "one");
        assert_eq!(second.0.lock().unwrap()[0].value, Some(NGValue::Int32(2)));

        drop(got);
        drop(registry);
        assert_eq!(dispatcher.dispatch(|_| {}), 0);
    }
}
