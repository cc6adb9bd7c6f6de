//! The `fbb_schema!` macro: per-message codec types from a declarative field
//! list.
//!
//! A schema invocation looks like:
//!
//! ```ignore
//! fbb_schema! {
//!     message open {
//!         optional dirfd: i32,
//!         string pathname: str,
//!         required flags: i32,
//!     }
//!     message barrier { }
//! }
//! ```
//!
//! Field kinds:
//!
//! | keyword      | meaning                               |
//! |--------------|---------------------------------------|
//! | `required`   | required scalar                       |
//! | `optional`   | optional scalar (presence tracked)    |
//! | `string`     | required string                       |
//! | `string_opt` | optional string                       |
//! | `strings`    | array of strings                      |
//! | `scalars`    | array of scalars                      |
//! | `fbb_one`    | required nested message               |
//! | `fbb_opt`    | optional nested message               |
//! | `fbb_many`   | array of nested messages              |
//!
//! The declared type after the colon is meaningful for scalar kinds; string
//! and message kinds write `str` and `fbb` there for uniformity. Every field
//! ends with a comma, including the last one.
//!
//! For each message the macro emits a module holding the `Header` struct
//! (the fixed-size wire record), a borrowing `Builder`, and a zero-copy
//! `View`. Tags are assigned by position starting at 1; tag 0 stays reserved
//! so an uninitialized record trips the accessors' assertions. At the schema
//! level it emits `tag_name()` and the `AnyView` dispatch enum.
//!
//! Because macro_rules lifetimes are hygienic, the borrow lifetime is
//! introduced exactly once (in the top-level rule) and threaded through the
//! helper macros as a metavariable.

/// Generate codec types for a message schema. See the module docs for the
/// field grammar.
#[macro_export]
macro_rules! fbb_schema {
    ( $( message $msg:ident { $($fields:tt)* } )* ) => {
        $crate::__fbb_walk! { ('fbb) (1u32) () $( [ $msg { $($fields)* } ] )* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_walk {
    ( ($lt:lifetime) ($next:expr) ( $( [$m:ident] )* ) ) => {
        /// Tag value reserved for uninitialized records.
        pub const TAG_UNUSED: u32 = 0;
        /// One past the last assigned tag.
        pub const TAG_NEXT: u32 = $next;

        /// The schema name of a tag, for diagnostics.
        pub fn tag_name(tag: u32) -> &'static str {
            $( if tag == $m::TAG { return stringify!($m); } )*
            "unknown"
        }

        ::paste::paste! {
            /// A parsed view of any message in this schema.
            pub enum AnyView<$lt> {
                $( [<$m:camel>]($m::View<$lt>), )*
            }

            impl<$lt> AnyView<$lt> {
                /// Parse a serialized record by its leading tag. `None` for
                /// a tag outside the schema.
                pub fn parse(bytes: &$lt [u8]) -> ::core::option::Option<AnyView<$lt>> {
                    let tag = $crate::fbb::peek_tag(bytes)?;
                    $( if tag == $m::TAG {
                        return ::core::option::Option::Some(
                            AnyView::[<$m:camel>]($m::View::from_bytes(bytes)));
                    } )*
                    ::core::option::Option::None
                }

                pub fn tag(&self) -> u32 {
                    match self {
                        $( AnyView::[<$m:camel>](_) => $m::TAG, )*
                    }
                }

                pub fn name(&self) -> &'static str {
                    match self {
                        $( AnyView::[<$m:camel>](_) => stringify!($m), )*
                    }
                }
            }
        }
    };
    ( ($lt:lifetime) ($next:expr) ( $($done:tt)* )
      [ $msg:ident { $($fields:tt)* } ] $($rest:tt)* ) => {
        $crate::__fbb_message! { $msg ($lt) ($next) { $($fields)* } }
        $crate::__fbb_walk! { ($lt) ($next + 1u32) ( $($done)* [$msg] ) $($rest)* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_message {
    ( $msg:ident ($lt:lifetime) ($tag:expr) { $($fields:tt)* } ) => {
        #[allow(dead_code)]
        pub mod $msg {
            /// This message's tag.
            pub const TAG: u32 = $tag;

            $crate::__fbb_relptrs! { (0usize) $($fields)* }
            $crate::__fbb_structs! { ($lt) $($fields)* }

            impl<$lt> Builder<$lt> {
                $crate::__fbb_setters! { ($lt) $($fields)* }
            }

            impl<$lt> $crate::fbb::FbbBuilder for Builder<$lt> {
                fn tag(&self) -> u32 {
                    TAG
                }

                fn measure(&self) -> usize {
                    #[allow(unused_mut)]
                    let mut off = $crate::fbb::roundup8(
                        ::core::mem::size_of::<Header>() + NUM_RELPTRS * 4,
                    );
                    $crate::__fbb_measure! { self, off, $($fields)* }
                    off
                }

                fn serialize_into(&self, dst: &mut [u8]) -> usize {
                    let total = self.measure();
                    assert!(dst.len() >= total);
                    for b in dst[..total].iter_mut() {
                        *b = 0;
                    }
                    $crate::fbb::put_header(dst, &self.wire);
                    let relptr_base = ::core::mem::size_of::<Header>();
                    #[allow(unused_mut)]
                    let mut cursor = $crate::fbb::roundup8(relptr_base + NUM_RELPTRS * 4);
                    #[allow(unused_mut)]
                    let mut rp = 0usize;
                    $crate::__fbb_serialize! { self, dst, relptr_base, cursor, rp, $($fields)* }
                    let _ = (relptr_base, cursor, rp);
                    total
                }
            }

            /// A typed zero-copy view over a serialized record.
            #[derive(Clone, Copy)]
            pub struct View<$lt> {
                base: *const u8,
                _life: ::core::marker::PhantomData<&$lt [u8]>,
            }

            impl<$lt> View<$lt> {
                /// Wrap a buffer holding a serialized record of this
                /// message. Asserts on a tag mismatch; the channel is
                /// trusted.
                pub fn from_bytes(bytes: &$lt [u8]) -> View<$lt> {
                    assert!(bytes.len() >= ::core::mem::size_of::<Header>());
                    unsafe { Self::from_ptr(bytes.as_ptr()) }
                }

                /// Downcast an untyped view. Asserts on a tag mismatch.
                pub fn from_raw(raw: $crate::fbb::RawView<$lt>) -> View<$lt> {
                    unsafe { Self::from_ptr(raw.base()) }
                }

                /// # Safety
                ///
                /// `base` must point to a complete serialized record of
                /// this message that outlives the view.
                pub unsafe fn from_ptr(base: *const u8) -> View<$lt> {
                    let v = View {
                        base,
                        _life: ::core::marker::PhantomData,
                    };
                    assert_eq!(v.tag(), TAG);
                    v
                }

                pub fn tag(&self) -> u32 {
                    unsafe { $crate::fbb::get_u32(self.base, 0) }
                }

                fn relptr(&self, idx: usize) -> u32 {
                    unsafe {
                        $crate::fbb::get_u32(
                            self.base,
                            ::core::mem::size_of::<Header>() + idx * 4,
                        )
                    }
                }

                $crate::__fbb_view_getters! { ($lt) $($fields)* }
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_relptrs {
    ( ($acc:expr) ) => {
        /// Number of non-scalar fields, i.e. entries in the relptr block.
        pub const NUM_RELPTRS: usize = $acc;
    };
    ( ($acc:expr) required $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_relptrs! { ($acc) $($rest)* }
    };
    ( ($acc:expr) optional $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_relptrs! { ($acc) $($rest)* }
    };
    ( ($acc:expr) $kind:ident $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! { const [<RP_ $name:upper>]: usize = $acc; }
        $crate::__fbb_relptrs! { ($acc + 1usize) $($rest)* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_structs {
    ( ($lt:lifetime) $($fields:tt)* ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($fields)* ]
            scal []
            lens []
            cnts []
            pres []
            bfld []
            binit []
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_structs_impl {
    (
        lt ($lt:lifetime)
        fields []
        scal [ $($s:tt)* ]
        lens [ $($l:tt)* ]
        cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ]
        bfld [ $($b:tt)* ]
        binit [ $($bi:tt)* ]
    ) => {
        ::paste::paste! {
            /// The fixed-size leading record: tag, scalars in schema order,
            /// string lengths, array counts, presence flags.
            #[repr(C)]
            #[derive(Clone, Copy)]
            pub struct Header {
                pub(crate) tag: u32,
                $($s)*
                $($l)*
                $($c)*
                $($p)*
            }

            /// An in-construction message. Borrows all non-scalar data from
            /// the caller; nothing is copied or allocated until
            /// `serialize_into`.
            pub struct Builder<$lt> {
                pub(crate) wire: Header,
                $($b)*
                _life: ::core::marker::PhantomData<&$lt ()>,
            }

            impl<$lt> Default for Builder<$lt> {
                fn default() -> Self {
                    Self::new()
                }
            }

            impl<$lt> Builder<$lt> {
                pub fn new() -> Builder<$lt> {
                    #[allow(unused_mut)]
                    let mut wire: Header = unsafe { ::core::mem::zeroed() };
                    wire.tag = TAG;
                    Builder {
                        wire,
                        $($bi)*
                        _life: ::core::marker::PhantomData,
                    }
                }
            }
        }
    };
    (
        lt ($lt:lifetime)
        fields [ required $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* pub(crate) $name: $ty, ]
            lens [ $($l)* ]
            cnts [ $($c)* ]
            pres [ $($p)* ]
            bfld [ $($b)* ]
            binit [ $($bi)* ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ optional $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* pub(crate) $name: $ty, ]
            lens [ $($l)* ]
            cnts [ $($c)* ]
            pres [ $($p)* pub(crate) [<has_ $name>]: u8, ]
            bfld [ $($b)* ]
            binit [ $($bi)* ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ string $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* ]
            lens [ $($l)* pub(crate) [<$name _len>]: $crate::fbb::FbbSize, ]
            cnts [ $($c)* ]
            pres [ $($p)* ]
            bfld [ $($b)* pub(crate) $name: ::core::option::Option<$crate::fbb::StrRef<$lt>>, ]
            binit [ $($bi)* $name: ::core::option::Option::None, ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ string_opt $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* ]
            lens [ $($l)* pub(crate) [<$name _len>]: $crate::fbb::FbbSize, ]
            cnts [ $($c)* ]
            pres [ $($p)* ]
            bfld [ $($b)* pub(crate) $name: ::core::option::Option<$crate::fbb::StrRef<$lt>>, ]
            binit [ $($bi)* $name: ::core::option::Option::None, ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ strings $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* ]
            lens [ $($l)* ]
            cnts [ $($c)* pub(crate) [<$name _count>]: $crate::fbb::FbbSize, ]
            pres [ $($p)* ]
            bfld [ $($b)* pub(crate) $name:
                ::core::option::Option<$crate::fbb::StrArraySource<$lt>>, ]
            binit [ $($bi)* $name: ::core::option::Option::None, ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ scalars $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* ]
            lens [ $($l)* ]
            cnts [ $($c)* pub(crate) [<$name _count>]: $crate::fbb::FbbSize, ]
            pres [ $($p)* ]
            bfld [ $($b)* pub(crate) $name: ::core::option::Option<&$lt [$ty]>, ]
            binit [ $($bi)* $name: ::core::option::Option::None, ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ fbb_one $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* ]
            lens [ $($l)* ]
            cnts [ $($c)* ]
            pres [ $($p)* ]
            bfld [ $($b)* pub(crate) $name:
                ::core::option::Option<&$lt dyn $crate::fbb::FbbBuilder>, ]
            binit [ $($bi)* $name: ::core::option::Option::None, ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ fbb_opt $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* ]
            lens [ $($l)* ]
            cnts [ $($c)* ]
            pres [ $($p)* ]
            bfld [ $($b)* pub(crate) $name:
                ::core::option::Option<&$lt dyn $crate::fbb::FbbBuilder>, ]
            binit [ $($bi)* $name: ::core::option::Option::None, ]
        }
    };
    (
        lt ($lt:lifetime)
        fields [ fbb_many $name:ident : $ty:ty, $($rest:tt)* ]
        scal [ $($s:tt)* ] lens [ $($l:tt)* ] cnts [ $($c:tt)* ]
        pres [ $($p:tt)* ] bfld [ $($b:tt)* ] binit [ $($bi:tt)* ]
    ) => {
        $crate::__fbb_structs_impl! {
            lt ($lt)
            fields [ $($rest)* ]
            scal [ $($s)* ]
            lens [ $($l)* ]
            cnts [ $($c)* pub(crate) [<$name _count>]: $crate::fbb::FbbSize, ]
            pres [ $($p)* ]
            bfld [ $($b)* pub(crate) $name:
                ::core::option::Option<$crate::fbb::MsgArraySource<$lt>>, ]
            binit [ $($bi)* $name: ::core::option::Option::None, ]
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_setters {
    ( ($lt:lifetime) ) => {};
    ( ($lt:lifetime) required $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<set_ $name>](&mut self, value: $ty) {
                self.wire.$name = value;
            }
            pub fn [<get_ $name>](&self) -> $ty {
                self.wire.$name
            }
        }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) optional $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<set_ $name>](&mut self, value: $ty) {
                self.wire.$name = value;
                self.wire.[<has_ $name>] = 1;
            }
            pub fn [<has_ $name>](&self) -> bool {
                self.wire.[<has_ $name>] != 0
            }
        }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) string $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_string_setter! { ($lt) $name }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) string_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_string_setter! { ($lt) $name }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) strings $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<set_ $name>](&mut self, src: $crate::fbb::StrArraySource<$lt>) {
                self.wire.[<$name _count>] = src.count();
                self.$name = ::core::option::Option::Some(src);
            }
            pub fn [<$name _count>](&self) -> $crate::fbb::FbbSize {
                self.wire.[<$name _count>]
            }
        }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) scalars $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<set_ $name>](&mut self, values: &$lt [$ty]) {
                self.wire.[<$name _count>] = values.len() as $crate::fbb::FbbSize;
                self.$name = ::core::option::Option::Some(values);
            }
        }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) fbb_one $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_msg_setter! { ($lt) $name }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) fbb_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_msg_setter! { ($lt) $name }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) fbb_many $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<set_ $name>](&mut self, src: $crate::fbb::MsgArraySource<$lt>) {
                self.wire.[<$name _count>] = src.count();
                self.$name = ::core::option::Option::Some(src);
            }
        }
        $crate::__fbb_setters! { ($lt) $($rest)* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_string_setter {
    ( ($lt:lifetime) $name:ident ) => {
        ::paste::paste! {
            pub fn [<set_ $name>]<V>(&mut self, value: V)
            where
                V: ::core::convert::Into<$crate::fbb::StrRef<$lt>>,
            {
                let r = value.into();
                self.wire.[<$name _len>] = r.len();
                self.$name = ::core::option::Option::Some(r);
            }

            /// Set from a NUL-terminated C string.
            ///
            /// # Safety
            ///
            /// `value` must be valid and outlive the builder's
            /// serialization.
            pub unsafe fn [<set_ $name _cstr>](&mut self, value: *const $crate::fbb::c_char) {
                self.[<set_ $name>]($crate::fbb::StrRef::from_c_str(value));
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_msg_setter {
    ( ($lt:lifetime) $name:ident ) => {
        ::paste::paste! {
            pub fn [<set_ $name>](&mut self, value: &$lt dyn $crate::fbb::FbbBuilder) {
                self.$name = ::core::option::Option::Some(value);
            }
        }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_measure {
    ( $slf:ident, $off:ident, ) => {};
    ( $slf:ident, $off:ident, required $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, optional $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, string $name:ident : $ty:ty, $($rest:tt)* ) => {
        if let ::core::option::Option::Some(r) = &$slf.$name {
            $off += $crate::fbb::roundup8(r.len() as usize + 1);
        }
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, string_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        if let ::core::option::Option::Some(r) = &$slf.$name {
            $off += $crate::fbb::roundup8(r.len() as usize + 1);
        }
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, strings $name:ident : $ty:ty, $($rest:tt)* ) => {
        if let ::core::option::Option::Some(src) = &$slf.$name {
            let n = src.count() as usize;
            let mut bytes = 0usize;
            let mut i = 0usize;
            while i < n {
                bytes += src.item(i).len() as usize + 1;
                i += 1;
            }
            $off += $crate::fbb::roundup8(n * 8) + $crate::fbb::roundup8(bytes);
        }
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, scalars $name:ident : $ty:ty, $($rest:tt)* ) => {
        if let ::core::option::Option::Some(values) = $slf.$name {
            $off += $crate::fbb::roundup8(values.len() * ::core::mem::size_of::<$ty>());
        }
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, fbb_one $name:ident : $ty:ty, $($rest:tt)* ) => {
        if let ::core::option::Option::Some(b) = $slf.$name {
            $off += b.measure();
        }
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, fbb_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        if let ::core::option::Option::Some(b) = $slf.$name {
            $off += b.measure();
        }
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
    ( $slf:ident, $off:ident, fbb_many $name:ident : $ty:ty, $($rest:tt)* ) => {
        if let ::core::option::Option::Some(src) = &$slf.$name {
            let n = src.count() as usize;
            $off += $crate::fbb::roundup8(n * 4);
            let mut i = 0usize;
            while i < n {
                $off += src.item(i).measure();
                i += 1;
            }
        }
        $crate::__fbb_measure! { $slf, $off, $($rest)* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_serialize {
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident, ) => {};
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      required $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      optional $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      string $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_serialize_string! { $slf, $dst, $rb, $cur, $rp, $name }
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      string_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_serialize_string! { $slf, $dst, $rb, $cur, $rp, $name }
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      strings $name:ident : $ty:ty, $($rest:tt)* ) => {
        {
            if let ::core::option::Option::Some(src) = &$slf.$name {
                $crate::fbb::put_relptr($dst, $rb, $rp, $cur as u32);
                let n = src.count() as usize;
                let table = $cur;
                let mut scur = $cur + $crate::fbb::roundup8(n * 8);
                let mut i = 0usize;
                while i < n {
                    let bytes = src.item(i).as_slice();
                    $crate::fbb::put_u32($dst, table + i * 8, scur as u32);
                    $crate::fbb::put_u32($dst, table + i * 8 + 4, bytes.len() as u32);
                    $dst[scur..scur + bytes.len()].copy_from_slice(bytes);
                    scur += bytes.len() + 1;
                    i += 1;
                }
                $cur = $crate::fbb::roundup8(scur);
            }
            $rp += 1;
        }
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      scalars $name:ident : $ty:ty, $($rest:tt)* ) => {
        {
            if let ::core::option::Option::Some(values) = $slf.$name {
                $crate::fbb::put_relptr($dst, $rb, $rp, $cur as u32);
                let byte_len = values.len() * ::core::mem::size_of::<$ty>();
                unsafe {
                    ::core::ptr::copy_nonoverlapping(
                        values.as_ptr() as *const u8,
                        $dst.as_mut_ptr().add($cur),
                        byte_len,
                    );
                }
                $cur += $crate::fbb::roundup8(byte_len);
            }
            $rp += 1;
        }
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      fbb_one $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_serialize_msg! { $slf, $dst, $rb, $cur, $rp, $name }
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      fbb_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        $crate::__fbb_serialize_msg! { $slf, $dst, $rb, $cur, $rp, $name }
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident,
      fbb_many $name:ident : $ty:ty, $($rest:tt)* ) => {
        {
            if let ::core::option::Option::Some(src) = &$slf.$name {
                $crate::fbb::put_relptr($dst, $rb, $rp, $cur as u32);
                let n = src.count() as usize;
                let table = $cur;
                let mut scur = $cur + $crate::fbb::roundup8(n * 4);
                let mut i = 0usize;
                while i < n {
                    let b = src.item(i);
                    $crate::fbb::put_u32($dst, table + i * 4, scur as u32);
                    let len = b.measure();
                    b.serialize_into(&mut $dst[scur..scur + len]);
                    scur += len;
                    i += 1;
                }
                $cur = scur;
            }
            $rp += 1;
        }
        $crate::__fbb_serialize! { $slf, $dst, $rb, $cur, $rp, $($rest)* }
    };
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_serialize_string {
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident, $name:ident ) => {{
        if let ::core::option::Option::Some(r) = &$slf.$name {
            $crate::fbb::put_relptr($dst, $rb, $rp, $cur as u32);
            let bytes = r.as_slice();
            $dst[$cur..$cur + bytes.len()].copy_from_slice(bytes);
            $cur += $crate::fbb::roundup8(bytes.len() + 1);
        }
        $rp += 1;
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_serialize_msg {
    ( $slf:ident, $dst:ident, $rb:ident, $cur:ident, $rp:ident, $name:ident ) => {{
        if let ::core::option::Option::Some(b) = $slf.$name {
            $crate::fbb::put_relptr($dst, $rb, $rp, $cur as u32);
            let len = b.measure();
            b.serialize_into(&mut $dst[$cur..$cur + len]);
            $cur += len;
        }
        $rp += 1;
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __fbb_view_getters {
    ( ($lt:lifetime) ) => {};
    ( ($lt:lifetime) required $name:ident : $ty:ty, $($rest:tt)* ) => {
        pub fn $name(&self) -> $ty {
            unsafe {
                ::core::ptr::addr_of!((*(self.base as *const Header)).$name).read_unaligned()
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) optional $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<has_ $name>](&self) -> bool {
                unsafe {
                    ::core::ptr::addr_of!((*(self.base as *const Header)).[<has_ $name>])
                        .read_unaligned() != 0
                }
            }
            pub fn $name(&self) -> $ty {
                assert!(self.[<has_ $name>]());
                unsafe {
                    ::core::ptr::addr_of!((*(self.base as *const Header)).$name).read_unaligned()
                }
            }
            pub fn [<$name _or>](&self, fallback: $ty) -> $ty {
                if self.[<has_ $name>]() { self.$name() } else { fallback }
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) string $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn $name(&self) -> &$lt [u8] {
                let off = self.relptr([<RP_ $name:upper>]);
                assert!(off != 0);
                let len = self.[<$name _len>]() as usize;
                unsafe { ::core::slice::from_raw_parts(self.base.add(off as usize), len) }
            }
            pub fn [<$name _len>](&self) -> $crate::fbb::FbbSize {
                unsafe {
                    ::core::ptr::addr_of!((*(self.base as *const Header)).[<$name _len>])
                        .read_unaligned()
                }
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) string_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<has_ $name>](&self) -> bool {
                self.relptr([<RP_ $name:upper>]) != 0
            }
            pub fn $name(&self) -> ::core::option::Option<&$lt [u8]> {
                let off = self.relptr([<RP_ $name:upper>]);
                if off == 0 {
                    return ::core::option::Option::None;
                }
                let len = self.[<$name _len>]() as usize;
                ::core::option::Option::Some(unsafe {
                    ::core::slice::from_raw_parts(self.base.add(off as usize), len)
                })
            }
            pub fn [<$name _len>](&self) -> $crate::fbb::FbbSize {
                unsafe {
                    ::core::ptr::addr_of!((*(self.base as *const Header)).[<$name _len>])
                        .read_unaligned()
                }
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) strings $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<has_ $name>](&self) -> bool {
                self.relptr([<RP_ $name:upper>]) != 0
            }
            pub fn [<$name _count>](&self) -> $crate::fbb::FbbSize {
                unsafe {
                    ::core::ptr::addr_of!((*(self.base as *const Header)).[<$name _count>])
                        .read_unaligned()
                }
            }
            pub fn [<$name _at>](&self, idx: usize) -> &$lt [u8] {
                assert!(idx < self.[<$name _count>]() as usize);
                let base_off = self.relptr([<RP_ $name:upper>]) as usize;
                assert!(base_off != 0);
                unsafe {
                    let off = $crate::fbb::get_u32(self.base, base_off + idx * 8) as usize;
                    let len = $crate::fbb::get_u32(self.base, base_off + idx * 8 + 4) as usize;
                    ::core::slice::from_raw_parts(self.base.add(off), len)
                }
            }
            pub fn [<$name _iter>](&self) -> impl ::core::iter::Iterator<Item = &$lt [u8]> {
                let v = *self;
                (0..self.[<$name _count>]() as usize).map(move |i| v.[<$name _at>](i))
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) scalars $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<has_ $name>](&self) -> bool {
                self.relptr([<RP_ $name:upper>]) != 0
            }
            pub fn [<$name _count>](&self) -> $crate::fbb::FbbSize {
                unsafe {
                    ::core::ptr::addr_of!((*(self.base as *const Header)).[<$name _count>])
                        .read_unaligned()
                }
            }
            pub fn [<$name _at>](&self, idx: usize) -> $ty {
                assert!(idx < self.[<$name _count>]() as usize);
                let base_off = self.relptr([<RP_ $name:upper>]) as usize;
                assert!(base_off != 0);
                unsafe {
                    (self.base.add(base_off + idx * ::core::mem::size_of::<$ty>())
                        as *const $ty)
                        .read_unaligned()
                }
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) fbb_one $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn $name(&self) -> $crate::fbb::RawView<$lt> {
                let off = self.relptr([<RP_ $name:upper>]);
                assert!(off != 0);
                unsafe { $crate::fbb::RawView::from_ptr(self.base.add(off as usize)) }
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) fbb_opt $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<has_ $name>](&self) -> bool {
                self.relptr([<RP_ $name:upper>]) != 0
            }
            pub fn $name(&self) -> ::core::option::Option<$crate::fbb::RawView<$lt>> {
                let off = self.relptr([<RP_ $name:upper>]);
                if off == 0 {
                    return ::core::option::Option::None;
                }
                ::core::option::Option::Some(unsafe {
                    $crate::fbb::RawView::from_ptr(self.base.add(off as usize))
                })
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
    ( ($lt:lifetime) fbb_many $name:ident : $ty:ty, $($rest:tt)* ) => {
        ::paste::paste! {
            pub fn [<has_ $name>](&self) -> bool {
                self.relptr([<RP_ $name:upper>]) != 0
            }
            pub fn [<$name _count>](&self) -> $crate::fbb::FbbSize {
                unsafe {
                    ::core::ptr::addr_of!((*(self.base as *const Header)).[<$name _count>])
                        .read_unaligned()
                }
            }
            pub fn [<$name _at>](&self, idx: usize) -> $crate::fbb::RawView<$lt> {
                assert!(idx < self.[<$name _count>]() as usize);
                let base_off = self.relptr([<RP_ $name:upper>]) as usize;
                assert!(base_off != 0);
                unsafe {
                    let off = $crate::fbb::get_u32(self.base, base_off + idx * 4) as usize;
                    $crate::fbb::RawView::from_ptr(self.base.add(off))
                }
            }
        }
        $crate::__fbb_view_getters! { ($lt) $($rest)* }
    };
}
