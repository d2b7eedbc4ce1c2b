// Metamethod name table.
//
// For primitive types, metamethods live in per-type metatables (which are
// namespaces). For instances, lookup goes through the class. Resolution is
// non-recursive: a failed lookup is a hard error, never another search.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MetaName {
    Add = 0,
    AddR,
    Sub,
    SubR,
    Mul,
    MulR,
    Div,
    DivR,
    Mod,
    ModR,
    Neg,
    And,
    AndR,
    Or,
    OrR,
    Xor,
    XorR,
    Shl,
    ShlR,
    Shr,
    ShrR,
    UShr,
    UShrR,
    Com,
    Cmp,
    Index,
    IndexAssign,
    Slice,
    SliceAssign,
    Field,
    FieldAssign,
    Call,
    Cat,
    CatR,
    In,
    Apply,
    Serialize,
    Deserialize,
}

pub const NUM_METAMETHODS: usize = MetaName::Deserialize as usize + 1;

impl MetaName {
    pub fn name(self) -> &'static str {
        match self {
            MetaName::Add => "opAdd",
            MetaName::AddR => "opAdd_r",
            MetaName::Sub => "opSub",
            MetaName::SubR => "opSub_r",
            MetaName::Mul => "opMul",
            MetaName::MulR => "opMul_r",
            MetaName::Div => "opDiv",
            MetaName::DivR => "opDiv_r",
            MetaName::Mod => "opMod",
            MetaName::ModR => "opMod_r",
            MetaName::Neg => "opNeg",
            MetaName::And => "opAnd",
            MetaName::AndR => "opAnd_r",
            MetaName::Or => "opOr",
            MetaName::OrR => "opOr_r",
            MetaName::Xor => "opXor",
            MetaName::XorR => "opXor_r",
            MetaName::Shl => "opShl",
            MetaName::ShlR => "opShl_r",
            MetaName::Shr => "opShr",
            MetaName::ShrR => "opShr_r",
            MetaName::UShr => "opUShr",
            MetaName::UShrR => "opUShr_r",
            MetaName::Com => "opCom",
            MetaName::Cmp => "opCmp",
            MetaName::Index => "opIndex",
            MetaName::IndexAssign => "opIndexAssign",
            MetaName::Slice => "opSlice",
            MetaName::SliceAssign => "opSliceAssign",
            MetaName::Field => "opField",
            MetaName::FieldAssign => "opFieldAssign",
            MetaName::Call => "opCall",
            MetaName::Cat => "opCat",
            MetaName::CatR => "opCat_r",
            MetaName::In => "opIn",
            MetaName::Apply => "opApply",
            MetaName::Serialize => "opSerialize",
            MetaName::Deserialize => "opDeserialize",
        }
    }

    pub fn all() -> impl Iterator<Item = MetaName> {
        (0..NUM_METAMETHODS as u8).map(|i| {
            // SAFETY: repr(u8), contiguous discriminants
            unsafe { std::mem::transmute::<u8, MetaName>(i) }
        })
    }

    /// The reflected partner of a binary metamethod, if it has one.
    pub fn reflected(self) -> Option<MetaName> {
        match self {
            MetaName::Add => Some(MetaName::AddR),
            MetaName::Sub => Some(MetaName::SubR),
            MetaName::Mul => Some(MetaName::MulR),
            MetaName::Div => Some(MetaName::DivR),
            MetaName::Mod => Some(MetaName::ModR),
            MetaName::And => Some(MetaName::AndR),
            MetaName::Or => Some(MetaName::OrR),
            MetaName::Xor => Some(MetaName::XorR),
            MetaName::Shl => Some(MetaName::ShlR),
            MetaName::Shr => Some(MetaName::ShrR),
            MetaName::UShr => Some(MetaName::UShrR),
            MetaName::Cat => Some(MetaName::CatR),
            _ => None,
        }
    }
}
