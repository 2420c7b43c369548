mod heap;
mod object;
mod ptr;
mod table;
mod trace;

pub use heap::Heap;
pub use object::{
    BoundMethod, Class, Closure, Function, Instance, LoxString, NativeFn, NativeFunction, Object,
    Upvalue,
};
pub use ptr::Gc;
pub use table::Table;
