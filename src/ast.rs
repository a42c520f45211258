use std::fmt;

/// AST 的根节点, 多个查询分支的析取: 任一分支满足即允许访问
#[derive(Debug, Clone, PartialEq)]
pub struct Union {
    pub clauses: Vec<Query>,
}

/// 单个查询分支: 根实体, 关联实体以及过滤条件
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub from: Entity,
    pub link: Link,
    pub condition: Condition,
}

/// 需要与根实体关联的实体列表, 保持首次出现的顺序
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Link {
    pub joins: Vec<Join>,
}

/// 关联实体, 以及把它和之前出现的实体连接起来的条件
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    pub entity: Entity,
    pub condition: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub clause: Clause,
}

/// 条件表达式树
#[derive(Debug, Clone, PartialEq)]
pub enum Clause {
    /// 逻辑与运算 (AND)
    Conjunction(Conjunction),
    /// 逻辑或运算 (OR)
    Disjunction(Disjunction),
    /// 运算符调用, 这是条件的叶子节点
    Call(Call),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conjunction {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Disjunction {
    pub clauses: Vec<Clause>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub operator: Operator,
    pub operands: Vec<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Attribute(Attribute),
    Constant(Constant),
    Call(Call),
}

/// 属于某个实体的字段, 例如 `users.id`
#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub entity: Entity,
    pub name: String,
}

/// 逻辑实体名 (表或集合), 通过 schema 解析到物理位置
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub name: String,
}

/// 字面量值, 数值和字符串互斥
#[derive(Debug, Clone, PartialEq)]
pub struct Constant {
    pub value: String,
    pub kind: ConstantKind,
    /// 来自字符串项时的原始文本, SQL 参数按原文绑定
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstantKind {
    Integer,
    Float,
    String,
}

impl Entity {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Operator {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Attribute {
    pub fn new(entity: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            entity: Entity::new(entity),
            name: name.into(),
        }
    }
}

impl Call {
    pub fn new(operator: impl Into<String>, operands: Vec<Operand>) -> Self {
        Self {
            operator: Operator::new(operator),
            operands,
        }
    }
}

impl Constant {
    /// 对字面量分类: 先去掉一对首尾引号, 依次尝试整数、浮点数, 否则视为字符串。
    /// 浮点数统一保留六位小数。
    /// 带引号的输入视为字符串字面量, 原文保存在 `text` 中。
    pub fn classify(raw: &str) -> Self {
        match raw.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
            Some(unquoted) => Self::string(unquoted),
            None => Self::classify_text(raw, None),
        }
    }

    /// 字符串项: 仍然分类, 但保留原文
    pub fn string(value: &str) -> Self {
        Self::classify_text(value, Some(value.to_string()))
    }

    fn classify_text(raw: &str, text: Option<String>) -> Self {
        if let Ok(i) = raw.parse::<i64>() {
            return Self {
                value: i.to_string(),
                kind: ConstantKind::Integer,
                text,
            };
        }
        if let Ok(f) = raw.parse::<f64>() {
            if f.is_finite() {
                return Self {
                    value: format!("{:.6}", f),
                    kind: ConstantKind::Float,
                    text,
                };
            }
        }
        Self {
            value: raw.to_string(),
            kind: ConstantKind::String,
            text,
        }
    }
}

impl Clause {
    /// 空的合取/析取不产生任何关系
    pub fn is_empty(&self) -> bool {
        match self {
            Clause::Conjunction(c) => c.clauses.iter().all(Clause::is_empty),
            Clause::Disjunction(d) => d.clauses.iter().all(Clause::is_empty),
            Clause::Call(_) => false,
        }
    }
}

impl Condition {
    pub fn is_empty(&self) -> bool {
        self.clause.is_empty()
    }
}

/// 遍历时交给访问者的节点引用
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Union(&'a Union),
    Query(&'a Query),
    Link(&'a Link),
    Condition(&'a Condition),
    Conjunction(&'a Conjunction),
    Disjunction(&'a Disjunction),
    Call(&'a Call),
    Attribute(&'a Attribute),
    Constant(&'a Constant),
    Entity(&'a Entity),
    Operator(&'a Operator),
}

/// 后序遍历: 子节点从左到右先于父节点被访问, 访问者返回错误时立即停止
pub trait Walk {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>;
}

impl Walk for Entity {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        visit(NodeRef::Entity(self))
    }
}

impl Walk for Operator {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        visit(NodeRef::Operator(self))
    }
}

impl Walk for Constant {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        visit(NodeRef::Constant(self))
    }
}

impl Walk for Attribute {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        self.entity.walk(visit)?;
        visit(NodeRef::Attribute(self))
    }
}

impl Walk for Operand {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        match self {
            Operand::Attribute(a) => a.walk(visit),
            Operand::Constant(c) => c.walk(visit),
            Operand::Call(c) => c.walk(visit),
        }
    }
}

impl Walk for Call {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        self.operator.walk(visit)?;
        for operand in &self.operands {
            operand.walk(visit)?;
        }
        visit(NodeRef::Call(self))
    }
}

impl Walk for Clause {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        match self {
            Clause::Conjunction(c) => {
                for clause in &c.clauses {
                    clause.walk(visit)?;
                }
                visit(NodeRef::Conjunction(c))
            }
            Clause::Disjunction(d) => {
                for clause in &d.clauses {
                    clause.walk(visit)?;
                }
                visit(NodeRef::Disjunction(d))
            }
            Clause::Call(c) => c.walk(visit),
        }
    }
}

impl Walk for Condition {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        self.clause.walk(visit)?;
        visit(NodeRef::Condition(self))
    }
}

impl Walk for Link {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        for join in &self.joins {
            if let Some(condition) = &join.condition {
                condition.walk(visit)?;
            }
            join.entity.walk(visit)?;
        }
        visit(NodeRef::Link(self))
    }
}

impl Walk for Query {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        self.link.walk(visit)?;
        self.condition.walk(visit)?;
        self.from.walk(visit)?;
        visit(NodeRef::Query(self))
    }
}

impl Walk for Union {
    fn walk<'a, E, F>(&'a self, visit: &mut F) -> Result<(), E>
    where
        F: FnMut(NodeRef<'a>) -> Result<(), E>,
    {
        for query in &self.clauses {
            query.walk(visit)?;
        }
        visit(NodeRef::Union(self))
    }
}

fn write_list<T: fmt::Display>(f: &mut fmt::Formatter<'_>, items: &[T]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", item)?;
    }
    Ok(())
}

impl fmt::Display for Union {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "union([")?;
        write_list(f, &self.clauses)?;
        write!(f, "])")
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query({}, {}, {})", self.from, self.link, self.condition)
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link([")?;
        write_list(f, &self.joins)?;
        write!(f, "])")
    }
}

impl fmt::Display for Join {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.condition {
            Some(condition) => write!(f, "{} on {}", self.entity, condition),
            None => write!(f, "{}", self.entity),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cond({})", self.clause)
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Clause::Conjunction(c) => {
                write!(f, "conj(")?;
                write_list(f, &c.clauses)?;
                write!(f, ")")
            }
            Clause::Disjunction(d) => {
                write!(f, "disj(")?;
                write_list(f, &d.clauses)?;
                write!(f, ")")
            }
            Clause::Call(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.operator.name)?;
        write_list(f, &self.operands)?;
        write!(f, ")")
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Attribute(a) => write!(f, "{}", a),
            Operand::Constant(c) => write!(f, "{}", c),
            Operand::Call(c) => write!(f, "{}", c),
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "att({}.{})", self.entity.name, self.name)
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ConstantKind::String => write!(f, "{:?}", self.value),
            _ => write!(f, "{}", self.value),
        }
    }
}
