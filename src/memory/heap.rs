use colored::*;

use super::object::{LoxString, Object, Upvalue};
use super::table::Table;
use super::trace::Traced;
use super::Gc;
use crate::compiler::compiler::FunctionState;
use crate::debug::{LOG_GC, STRESS_GC};
use crate::vm::value::Value;
use crate::vm::CallFrame;

const DEFAULT_NEXT_GC: usize = 1024 * 1024;
const HEAP_GROW_FACTOR: usize = 2;

/// Owns every heap object and all the state the collector treats as roots.
/// The compiler and the VM both borrow the heap mutably, which is what lets
/// a collection triggered by either one see the other's live objects.
///
/// Collection is tri-color mark-sweep: roots are marked gray, the gray
/// worklist is drained by marking everything a gray object references
/// (blackening it), and the sweep frees whatever stayed white.
pub struct Heap {
    /// The VM value stack. Every slot is a root.
    pub stack: Vec<Value>,

    /// Global variables, keyed by interned name.
    pub globals: Table,

    /// Active call frames; each frame's closure is a root.
    pub call_frames: Vec<CallFrame>,

    /// Upvalues still pointing into the stack, sorted ascending by slot.
    pub open_upvalues: Vec<Gc<Object>>,

    /// Functions currently being compiled. Their chunks accumulate
    /// constants before the function object itself is tracked, so the
    /// collector has to reach through them explicitly.
    pub functions: Vec<FunctionState>,

    /// The interned name of initializer methods.
    pub init_string: Gc<Object>,

    /// Every tracked object. Boxing keeps addresses stable while the vector
    /// doubles as the sweep enumeration.
    objects: Vec<Box<Traced<Object>>>,

    /// Intern table; holds its keys weakly (see `sweep`).
    strings: Table,

    /// Marked but not yet scanned objects.
    gray_list: Vec<Gc<Object>>,

    bytes_allocated: usize,
    next_gc: usize,
}

impl Heap {
    pub fn new() -> Self {
        // The `init` string is born before the heap exists, so build its
        // allocation by hand.
        let mut objects = Vec::new();
        let mut strings = Table::new();
        let mut boxed = Box::new(Traced::new(Object::String(LoxString::new("init".to_owned()))));
        let init_string = Gc::new(boxed.as_mut());
        objects.push(boxed);
        strings.set(init_string, Value::Nil);

        Self {
            stack: Vec::new(),
            globals: Table::new(),
            call_frames: Vec::new(),
            open_upvalues: Vec::new(),
            functions: Vec::new(),
            init_string,
            objects,
            strings,
            gray_list: Vec::new(),
            bytes_allocated: 0,
            next_gc: DEFAULT_NEXT_GC,
        }
    }

    /// Interns a string, returning the existing object when one with the
    /// same bytes is already live.
    pub fn intern(&mut self, s: String) -> Gc<Object> {
        let hash = LoxString::hash_of(&s);
        if let Some(existing) = self.strings.find_string(&s, hash) {
            return existing;
        }

        let object = self.track(Object::String(LoxString { data: s, hash }));
        self.strings.set(object, Value::Nil);
        object
    }

    /// Hands an object to the collector. May collect first, so anything the
    /// object references must already be reachable from a root.
    pub fn track(&mut self, object: Object) -> Gc<Object> {
        self.on_track(heap_size(&object));

        let mut boxed = Box::new(Traced::new(object));
        let gc = Gc::new(boxed.as_mut());
        self.objects.push(boxed);

        if LOG_GC {
            println!("{}\t\tTrack {}", "[GC]".cyan(), gc.as_ref());
        }
        gc
    }

    fn on_track(&mut self, allocated: usize) {
        if STRESS_GC {
            self.collect();
        }
        self.bytes_allocated += allocated;
        if self.bytes_allocated > self.next_gc {
            self.collect();
        }
    }

    pub(crate) fn object_count(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn collect(&mut self) {
        let before = self.bytes_allocated;
        if LOG_GC {
            println!("{}", "[GC]\t\tBEGIN".cyan());
        }

        self.mark_roots();
        self.trace_references();
        self.sweep();

        self.next_gc = self.bytes_allocated * HEAP_GROW_FACTOR;

        if LOG_GC {
            println!(
                "{}\t\tCollected {} bytes (from {} to {}), next at {}",
                "[GC]".cyan(),
                before - self.bytes_allocated,
                before,
                self.bytes_allocated,
                self.next_gc
            );
            println!("{}", "[GC]\t\tEND".cyan());
        }
    }

    fn mark_roots(&mut self) {
        let mut gray_list = std::mem::take(&mut self.gray_list);

        for value in self.stack.iter() {
            mark_value(&mut gray_list, *value);
        }

        for (key, value) in self.globals.iter() {
            mark_object(&mut gray_list, key);
            mark_value(&mut gray_list, value);
        }

        for frame in self.call_frames.iter() {
            mark_object(&mut gray_list, frame.closure);
        }

        for upvalue in self.open_upvalues.iter() {
            mark_object(&mut gray_list, *upvalue);
        }

        mark_object(&mut gray_list, self.init_string);

        // Functions under compilation are not tracked yet; reach through
        // their names and constant pools directly.
        for state in self.functions.iter() {
            if let Some(name) = state.function.name {
                mark_object(&mut gray_list, name);
            }
            for constant in state.function.chunk.constants.iter() {
                mark_value(&mut gray_list, *constant);
            }
        }

        self.gray_list = gray_list;
    }

    fn trace_references(&mut self) {
        while let Some(object) = self.gray_list.pop() {
            self.blacken(object);
        }
    }

    /// Marks everything `object` references. Once this returns the object
    /// is black: marked and fully scanned.
    fn blacken(&mut self, object: Gc<Object>) {
        if LOG_GC {
            println!("{}\t\tBlacken {}", "[GC]".cyan(), object.as_ref());
        }

        let gray_list = &mut self.gray_list;
        match object.as_ref() {
            Object::String(_) | Object::Native(_) => {}
            Object::Function(function) => {
                if let Some(name) = function.name {
                    mark_object(gray_list, name);
                }
                for constant in function.chunk.constants.iter() {
                    mark_value(gray_list, *constant);
                }
            }
            Object::Closure(closure) => {
                mark_object(gray_list, closure.function);
                for upvalue in closure.upvalues.iter() {
                    mark_object(gray_list, *upvalue);
                }
            }
            Object::Upvalue(upvalue) => match upvalue {
                Upvalue::Closed(value) => mark_value(gray_list, *value),
                Upvalue::Open(_) => {}
            },
            Object::Class(class) => {
                mark_object(gray_list, class.name);
                for (key, value) in class.methods.iter() {
                    mark_object(gray_list, key);
                    mark_value(gray_list, value);
                }
            }
            Object::Instance(instance) => {
                mark_object(gray_list, instance.class);
                for (key, value) in instance.fields.iter() {
                    mark_object(gray_list, key);
                    mark_value(gray_list, value);
                }
            }
            Object::BoundMethod(bound) => {
                mark_value(gray_list, bound.receiver);
                mark_object(gray_list, bound.method);
            }
        }
    }

    fn sweep(&mut self) {
        // The intern table references strings weakly: drop entries whose
        // keys are about to be freed so no dangling keys survive the sweep.
        self.strings.remove_unmarked();

        let mut i = 0;
        while i < self.objects.len() {
            if self.objects[i].marked() {
                self.objects[i].set_mark(false);
                i += 1;
            } else {
                if LOG_GC {
                    println!("{}\t\tSweep {}", "[GC]".cyan(), self.objects[i].data);
                }
                let removed = self.objects.swap_remove(i);
                self.bytes_allocated = self
                    .bytes_allocated
                    .saturating_sub(heap_size(&removed.data));
                // The swapped-in element takes index i; don't advance.
            }
        }
    }
}

fn mark_object(gray_list: &mut Vec<Gc<Object>>, object: Gc<Object>) {
    // Gray and black objects both carry the mark; the difference is whether
    // they are still queued. Marking twice must not re-queue.
    if !object.marked() {
        object.mark();
        gray_list.push(object);
    }
}

fn mark_value(gray_list: &mut Vec<Gc<Object>>, value: Value) {
    if let Value::Object(object) = value {
        mark_object(gray_list, object);
    }
}

/// Bytes charged against the collection threshold. Only payloads that are
/// fixed at allocation time count, so track and sweep always agree.
fn heap_size(object: &Object) -> usize {
    let payload = match object {
        Object::String(s) => s.data.capacity(),
        _ => 0,
    };
    std::mem::size_of::<Traced<Object>>() + payload
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_returns_identical_pointers() {
        let mut heap = Heap::new();
        let a = heap.intern("hi".to_owned());
        let b = heap.intern("hi".to_owned());
        let c = heap.intern("other".to_owned());
        assert!(Gc::ptr_eq(&a, &b));
        assert!(!Gc::ptr_eq(&a, &c));
    }

    #[test]
    fn collect_frees_unreachable_objects() {
        let mut heap = Heap::new();
        let baseline = heap.object_count();

        let garbage = heap.intern("garbage".to_owned());
        let kept = heap.intern("kept".to_owned());
        heap.stack.push(kept.into());
        assert_eq!(heap.object_count(), baseline + 2);

        heap.collect();
        assert_eq!(heap.object_count(), baseline + 1);

        // The freed string is really gone from the intern table: interning
        // the same bytes allocates a fresh object.
        let again = heap.intern("garbage".to_owned());
        let _ = garbage;
        assert_eq!(heap.object_count(), baseline + 2);
        assert!(Gc::ptr_eq(&heap.intern("kept".to_owned()), &kept));
        drop(again);
    }

    #[test]
    fn collect_keeps_globals_and_init_string() {
        let mut heap = Heap::new();
        let name = heap.intern("answer".to_owned());
        heap.globals.set(name, Value::Number(42.0));

        heap.collect();
        assert_eq!(heap.globals.get(name), Some(Value::Number(42.0)));
        assert_eq!(heap.init_string.as_ref().as_string().as_str(), "init");
    }

    #[test]
    fn collect_traces_through_closed_upvalues() {
        let mut heap = Heap::new();
        let s = heap.intern("captured".to_owned());
        let upvalue = heap.track(Object::Upvalue(Upvalue::Closed(s.into())));
        heap.stack.push(upvalue.into());

        heap.collect();
        // Both the upvalue and the string it closes over survive.
        assert_eq!(s.as_ref().as_string().as_str(), "captured");
        assert!(matches!(upvalue.as_ref(), Object::Upvalue(_)));
    }
}
